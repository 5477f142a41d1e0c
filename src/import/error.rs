use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::schema::CanonicalField;

/// Invalid tenant configuration. Always fatal, raised before any row is read.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigurationError {
    #[error("unknown job field '{0}'")]
    UnknownField(String),

    #[error("malformed {document} document: {message}")]
    Malformed { document: &'static str, message: String },

    #[error("invalid regex for {field}: {message}")]
    InvalidRegex { field: CanonicalField, message: String },

    #[error("range rule for {field} has min greater than max")]
    InvertedRange { field: CanonicalField },

    #[error("rule '{rule}' cannot apply to {field}")]
    RuleNotApplicable { field: CanonicalField, rule: &'static str },

    #[error("default value for {field} violates its rules: {reason}")]
    InvalidDefault { field: CanonicalField, reason: String },

    #[error("required field {0} cannot have a default value")]
    RequiredWithDefault(CanonicalField),

    #[error("invalid option {option}: {message}")]
    InvalidOption { option: &'static str, message: String },

    #[error("mapping_config lists header '{0}' more than once")]
    DuplicateMapping(String),
}

/// The uploaded file could not be read as a table.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ParseError {
    #[error("file is not valid UTF-8 text")]
    Encoding,

    #[error("file could not be read as a table: {0}")]
    Malformed(String),

    #[error("header row is empty")]
    EmptyHeader,

    #[error("row {row_index} has {width} cells but the header only has {header_width}")]
    RaggedRow {
        row_index: u64,
        width: usize,
        header_width: usize,
    },

    #[error("source file unavailable: {0}")]
    Unavailable(String),
}

impl From<csv::Error> for ParseError {
    fn from(err: csv::Error) -> Self {
        match err.kind() {
            csv::ErrorKind::Utf8 { .. } => ParseError::Encoding,
            _ => ParseError::Malformed(err.to_string()),
        }
    }
}

impl From<calamine::XlsxError> for ParseError {
    fn from(err: calamine::XlsxError) -> Self {
        ParseError::Malformed(err.to_string())
    }
}

/// Required columns that could not be resolved from the header row.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("required fields not mapped to any column: {}", join_fields(.missing))]
pub struct MappingError {
    pub missing: Vec<CanonicalField>,
}

fn join_fields(fields: &[CanonicalField]) -> String {
    fields
        .iter()
        .map(CanonicalField::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// One field violation inside a row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub reason: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// How a row ended up excluded from the import.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowErrorKind {
    /// Failed validation, counted in `failed_imports`.
    Invalid,
    /// Repeat of an earlier row, counted in `skipped_records`.
    Duplicate,
    /// Valid row whose batch could not be committed, counted in `failed_imports`.
    Persistence,
}

impl RowErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Invalid => "invalid",
            Self::Duplicate => "duplicate",
            Self::Persistence => "persistence",
        }
    }
}

impl std::str::FromStr for RowErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "invalid" => Ok(Self::Invalid),
            "duplicate" => Ok(Self::Duplicate),
            "persistence" => Ok(Self::Persistence),
            other => Err(format!("unknown row error kind '{}'", other)),
        }
    }
}

/// All problems found in one input row, aggregated into a single entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowError {
    pub row_index: u64,
    pub kind: RowErrorKind,
    pub errors: Vec<FieldError>,
}

impl RowError {
    pub fn invalid(row_index: u64, errors: Vec<FieldError>) -> Self {
        Self {
            row_index,
            kind: RowErrorKind::Invalid,
            errors,
        }
    }

    pub fn duplicate(row_index: u64, first_row: u64, fields: &[CanonicalField]) -> Self {
        Self {
            row_index,
            kind: RowErrorKind::Duplicate,
            errors: vec![FieldError::new(
                join_fields(fields),
                format!("duplicate of row {}", first_row),
            )],
        }
    }

    pub fn persistence(row_index: u64, reason: &str) -> Self {
        Self {
            row_index,
            kind: RowErrorKind::Persistence,
            errors: vec![FieldError::new("*", reason)],
        }
    }

    /// Whether `field` is among the violations of this row.
    pub fn mentions(&self, field: CanonicalField) -> bool {
        self.errors.iter().any(|e| e.field == field.as_str())
    }
}

/// The store could not persist a batch or a state change.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("persistence failure: {0}")]
pub struct PersistenceError(pub String);

/// Category of the error summarized on an import job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Parse,
    Configuration,
    Mapping,
    Persistence,
    Timeout,
    Internal,
}

/// The `last_error` summary attached to an import job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl ImportFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(max_duration_secs: u64) -> Self {
        Self::new(
            FailureKind::Timeout,
            format!("timeout: import exceeded {}s", max_duration_secs),
        )
    }
}

impl From<&ConfigurationError> for ImportFailure {
    fn from(err: &ConfigurationError) -> Self {
        Self::new(FailureKind::Configuration, err.to_string())
    }
}

impl From<&ParseError> for ImportFailure {
    fn from(err: &ParseError) -> Self {
        Self::new(FailureKind::Parse, err.to_string())
    }
}

impl From<&MappingError> for ImportFailure {
    fn from(err: &MappingError) -> Self {
        Self::new(FailureKind::Mapping, err.to_string())
    }
}
