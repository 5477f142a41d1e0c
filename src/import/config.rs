//! Typed import configuration.
//!
//! Tenants send three loosely structured documents with an import (column
//! mapping, validation rules, default values) plus an options document. They
//! are compiled here into an [`ImportConfig`] before any file is touched, so a
//! broken configuration fails the request instead of a batch run.
//!
//! Rule descriptors are tagged by `kind`:
//!
//! ```json
//! { "salary_min": [{ "kind": "range", "min": 0 }],
//!   "employment_type": [{ "kind": "enum", "values": ["full-time", "part-time"] }],
//!   "location": [{ "kind": "required" }] }
//! ```

use chrono::format::{Item, StrftimeItems};
use chrono::NaiveDate;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::error::ConfigurationError;
use super::schema::{CanonicalField, FieldType};

pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const MAX_BATCH_SIZE: usize = 1000;
pub const DEFAULT_DATE_FORMAT: &str = "%Y-%m-%d";

/// One validation rule as written in the `validation_rules` document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum RuleDescriptor {
    Required,
    Range {
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
    Enum {
        values: Vec<String>,
        #[serde(default)]
        case_insensitive: bool,
    },
    Regex {
        pattern: String,
    },
    Length {
        #[serde(default)]
        min: Option<usize>,
        #[serde(default)]
        max: Option<usize>,
    },
    Type {
        format: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DuplicateRuleDescriptor {
    pub fields: Vec<String>,
    #[serde(default)]
    pub case_insensitive: bool,
}

/// The `options` document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OptionsDocument {
    pub batch_size: Option<usize>,
    pub delimiter: Option<char>,
    pub date_format: Option<String>,
    pub decimal_separator: Option<char>,
    pub thousands_separator: Option<char>,
    pub ragged_tolerance: Option<usize>,
    pub duplicates: Option<DuplicateRuleDescriptor>,
}

/// Raw configuration documents exactly as persisted on the import job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigDocuments {
    #[serde(default)]
    pub mapping_config: serde_json::Value,
    #[serde(default)]
    pub validation_rules: serde_json::Value,
    #[serde(default)]
    pub default_values: serde_json::Value,
    #[serde(default)]
    pub options: serde_json::Value,
}

/// A parsed cell value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Text(String),
    Decimal(f64),
    Boolean(bool),
    Date(NaiveDate),
}

impl FieldValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_decimal(&self) -> Option<f64> {
        match self {
            FieldValue::Decimal(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            FieldValue::Date(v) => Some(*v),
            _ => None,
        }
    }

    /// Stable text form used for duplicate keys.
    pub fn key_text(&self) -> String {
        match self {
            FieldValue::Text(s) => s.clone(),
            FieldValue::Decimal(v) => v.to_string(),
            FieldValue::Boolean(v) => v.to_string(),
            FieldValue::Date(d) => d.format(DEFAULT_DATE_FORMAT).to_string(),
        }
    }
}

/// Explicit, environment-independent formats for typed cells.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsingOptions {
    pub delimiter: u8,
    pub date_format: String,
    pub decimal_separator: char,
    pub thousands_separator: Option<char>,
    /// Extra trailing cells allowed beyond the header width, which must be
    /// blank. `None` allows any number of blank trailing cells.
    pub ragged_tolerance: Option<usize>,
}

impl Default for ParsingOptions {
    fn default() -> Self {
        Self {
            delimiter: b',',
            date_format: DEFAULT_DATE_FORMAT.to_string(),
            decimal_separator: '.',
            thousands_separator: None,
            ragged_tolerance: None,
        }
    }
}

impl ParsingOptions {
    /// Parse a non-blank cell into the type of `field`.
    pub fn parse_value(
        &self,
        field: CanonicalField,
        raw: &str,
        date_format: Option<&str>,
    ) -> Result<FieldValue, String> {
        let raw = raw.trim();
        match field.field_type() {
            FieldType::Text => Ok(FieldValue::Text(raw.to_string())),
            FieldType::Email => {
                if is_email(raw) {
                    Ok(FieldValue::Text(raw.to_string()))
                } else {
                    Err(format!("'{}' is not a valid email address", raw))
                }
            }
            FieldType::Boolean => match raw.to_ascii_lowercase().as_str() {
                "true" | "yes" | "y" | "1" => Ok(FieldValue::Boolean(true)),
                "false" | "no" | "n" | "0" => Ok(FieldValue::Boolean(false)),
                _ => Err(format!("'{}' is not a yes/no value", raw)),
            },
            FieldType::Decimal => self.parse_decimal(raw).map(FieldValue::Decimal),
            FieldType::Date => {
                let format = date_format.unwrap_or(&self.date_format);
                NaiveDate::parse_from_str(raw, format)
                    .map(FieldValue::Date)
                    .map_err(|_| format!("'{}' does not match date format {}", raw, format))
            }
        }
    }

    fn parse_decimal(&self, raw: &str) -> Result<f64, String> {
        let mut normalized = String::with_capacity(raw.len());
        for c in raw.chars() {
            if Some(c) == self.thousands_separator {
                continue;
            }
            if c == self.decimal_separator {
                normalized.push('.');
            } else if c.is_ascii_digit() || c == '-' || c == '+' {
                normalized.push(c);
            } else {
                return Err(format!("'{}' is not a number", raw));
            }
        }
        match normalized.parse::<f64>() {
            Ok(v) if v.is_finite() => Ok(v),
            _ => Err(format!("'{}' is not a number", raw)),
        }
    }
}

fn is_email(raw: &str) -> bool {
    let mut parts = raw.split('@');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(local), Some(domain), None) => {
            !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !raw.chars().any(char::is_whitespace)
        }
        _ => false,
    }
}

#[derive(Debug, Clone)]
enum Check {
    Range { min: Option<f64>, max: Option<f64> },
    OneOf { values: Vec<String>, case_insensitive: bool },
    Pattern(Regex),
    Length { min: Option<usize>, max: Option<usize> },
}

impl Check {
    fn violation(&self, value: &FieldValue) -> Option<String> {
        match self {
            Check::Range { min, max } => {
                let v = value.as_decimal()?;
                if let Some(min) = min {
                    if v < *min {
                        return Some(format!("{} is below the minimum of {}", v, min));
                    }
                }
                if let Some(max) = max {
                    if v > *max {
                        return Some(format!("{} is above the maximum of {}", v, max));
                    }
                }
                None
            }
            Check::OneOf {
                values,
                case_insensitive,
            } => {
                let text = value.as_text()?;
                let allowed = values.iter().any(|allowed| {
                    if *case_insensitive {
                        allowed.eq_ignore_ascii_case(text)
                    } else {
                        allowed == text
                    }
                });
                (!allowed).then(|| format!("'{}' is not one of: {}", text, values.join(", ")))
            }
            Check::Pattern(regex) => {
                let text = value.as_text()?;
                (!regex.is_match(text))
                    .then(|| format!("'{}' does not match pattern {}", text, regex.as_str()))
            }
            Check::Length { min, max } => {
                let len = value.as_text()?.chars().count();
                if let Some(min) = min {
                    if len < *min {
                        return Some(format!("must be at least {} characters", min));
                    }
                }
                if let Some(max) = max {
                    if len > *max {
                        return Some(format!("must be at most {} characters", max));
                    }
                }
                None
            }
        }
    }
}

/// Compiled checks for one canonical field.
#[derive(Debug, Clone, Default)]
pub struct FieldValidator {
    checks: Vec<Check>,
    date_format: Option<String>,
}

impl FieldValidator {
    pub fn date_format(&self) -> Option<&str> {
        self.date_format.as_deref()
    }

    /// Every rule the value violates, in declaration order.
    pub fn violations(&self, value: &FieldValue) -> Vec<String> {
        self.checks.iter().filter_map(|c| c.violation(value)).collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DuplicateRule {
    pub fields: Vec<CanonicalField>,
    pub case_insensitive: bool,
}

/// Fully validated configuration for one import job.
#[derive(Debug, Clone)]
pub struct ImportConfig {
    /// Lowercased header -> field, from `mapping_config`.
    pub mapping: HashMap<String, CanonicalField>,
    pub required: BTreeSet<CanonicalField>,
    pub validators: BTreeMap<CanonicalField, FieldValidator>,
    pub defaults: BTreeMap<CanonicalField, FieldValue>,
    pub parsing: ParsingOptions,
    pub batch_size: Option<usize>,
    pub duplicates: Option<DuplicateRule>,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            mapping: HashMap::new(),
            required: intrinsic_required(),
            validators: BTreeMap::new(),
            defaults: BTreeMap::new(),
            parsing: ParsingOptions::default(),
            batch_size: None,
            duplicates: None,
        }
    }
}

fn intrinsic_required() -> BTreeSet<CanonicalField> {
    CanonicalField::ALL
        .iter()
        .copied()
        .filter(CanonicalField::is_intrinsically_required)
        .collect()
}

fn parse_document<T: DeserializeOwned + Default>(
    document: &'static str,
    value: &serde_json::Value,
) -> Result<T, ConfigurationError> {
    if value.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(value.clone()).map_err(|e| ConfigurationError::Malformed {
        document,
        message: e.to_string(),
    })
}

fn parse_field(name: &str) -> Result<CanonicalField, ConfigurationError> {
    name.parse()
        .map_err(|_| ConfigurationError::UnknownField(name.trim().to_string()))
}

impl ImportConfig {
    /// Compile the raw documents, rejecting anything that could not be applied.
    pub fn from_documents(docs: &ConfigDocuments) -> Result<Self, ConfigurationError> {
        let mapping_doc: BTreeMap<String, String> =
            parse_document("mapping_config", &docs.mapping_config)?;
        let rules_doc: BTreeMap<String, Vec<RuleDescriptor>> =
            parse_document("validation_rules", &docs.validation_rules)?;
        let defaults_doc: BTreeMap<String, String> =
            parse_document("default_values", &docs.default_values)?;
        let options: OptionsDocument = parse_document("options", &docs.options)?;

        let mut config = ImportConfig {
            parsing: compile_parsing(&options)?,
            batch_size: compile_batch_size(options.batch_size)?,
            ..ImportConfig::default()
        };

        for (header, field) in &mapping_doc {
            let field = parse_field(field)?;
            let key = header.trim().to_lowercase();
            if config.mapping.insert(key.clone(), field).is_some() {
                return Err(ConfigurationError::DuplicateMapping(key));
            }
        }

        for (name, rules) in &rules_doc {
            let field = parse_field(name)?;
            let validator = config.validators.entry(field).or_default();
            for rule in rules {
                compile_rule(field, rule, validator, &mut config.required)?;
            }
        }

        for (name, raw) in &defaults_doc {
            let field = parse_field(name)?;
            if config.required.contains(&field) {
                return Err(ConfigurationError::RequiredWithDefault(field));
            }
            let validator = config.validators.get(&field);
            let value = config
                .parsing
                .parse_value(field, raw, validator.and_then(FieldValidator::date_format))
                .map_err(|reason| ConfigurationError::InvalidDefault { field, reason })?;
            if let Some(reason) = validator.and_then(|v| v.violations(&value).into_iter().next()) {
                return Err(ConfigurationError::InvalidDefault { field, reason });
            }
            config.defaults.insert(field, value);
        }

        if let Some(dup) = &options.duplicates {
            config.duplicates = Some(compile_duplicates(dup)?);
        }

        Ok(config)
    }

    pub fn batch_size_or(&self, fallback: usize) -> usize {
        self.batch_size.unwrap_or(fallback)
    }

    pub fn is_required(&self, field: CanonicalField) -> bool {
        self.required.contains(&field)
    }
}

fn compile_rule(
    field: CanonicalField,
    rule: &RuleDescriptor,
    validator: &mut FieldValidator,
    required: &mut BTreeSet<CanonicalField>,
) -> Result<(), ConfigurationError> {
    let field_type = field.field_type();
    let textual = matches!(field_type, FieldType::Text | FieldType::Email);
    match rule {
        RuleDescriptor::Required => {
            required.insert(field);
        }
        RuleDescriptor::Range { min, max } => {
            if field_type != FieldType::Decimal {
                return Err(ConfigurationError::RuleNotApplicable { field, rule: "range" });
            }
            if let (Some(min), Some(max)) = (min, max) {
                if min > max {
                    return Err(ConfigurationError::InvertedRange { field });
                }
            }
            validator.checks.push(Check::Range {
                min: *min,
                max: *max,
            });
        }
        RuleDescriptor::Enum {
            values,
            case_insensitive,
        } => {
            if !textual {
                return Err(ConfigurationError::RuleNotApplicable { field, rule: "enum" });
            }
            validator.checks.push(Check::OneOf {
                values: values.clone(),
                case_insensitive: *case_insensitive,
            });
        }
        RuleDescriptor::Regex { pattern } => {
            if !textual {
                return Err(ConfigurationError::RuleNotApplicable { field, rule: "regex" });
            }
            let regex = Regex::new(pattern).map_err(|e| ConfigurationError::InvalidRegex {
                field,
                message: e.to_string(),
            })?;
            validator.checks.push(Check::Pattern(regex));
        }
        RuleDescriptor::Length { min, max } => {
            if !textual {
                return Err(ConfigurationError::RuleNotApplicable { field, rule: "length" });
            }
            if let (Some(min), Some(max)) = (min, max) {
                if min > max {
                    return Err(ConfigurationError::InvertedRange { field });
                }
            }
            validator.checks.push(Check::Length {
                min: *min,
                max: *max,
            });
        }
        RuleDescriptor::Type { format } => {
            if field_type != FieldType::Date {
                return Err(ConfigurationError::RuleNotApplicable { field, rule: "type" });
            }
            validate_date_format("format", format)?;
            validator.date_format = Some(format.clone());
        }
    }
    Ok(())
}

fn validate_date_format(option: &'static str, format: &str) -> Result<(), ConfigurationError> {
    if format.trim().is_empty() || StrftimeItems::new(format).any(|item| matches!(item, Item::Error)) {
        return Err(ConfigurationError::InvalidOption {
            option,
            message: format!("'{}' is not a valid date format", format),
        });
    }
    Ok(())
}

fn compile_batch_size(batch_size: Option<usize>) -> Result<Option<usize>, ConfigurationError> {
    match batch_size {
        Some(size) if size == 0 || size > MAX_BATCH_SIZE => Err(ConfigurationError::InvalidOption {
            option: "batch_size",
            message: format!("must be between 1 and {}", MAX_BATCH_SIZE),
        }),
        other => Ok(other),
    }
}

fn compile_parsing(options: &OptionsDocument) -> Result<ParsingOptions, ConfigurationError> {
    let mut parsing = ParsingOptions::default();

    if let Some(delimiter) = options.delimiter {
        if !delimiter.is_ascii() || matches!(delimiter, '"' | '\n' | '\r') {
            return Err(ConfigurationError::InvalidOption {
                option: "delimiter",
                message: format!("'{}' cannot be used as a delimiter", delimiter.escape_default()),
            });
        }
        parsing.delimiter = delimiter as u8;
    }
    if let Some(format) = &options.date_format {
        validate_date_format("date_format", format)?;
        parsing.date_format = format.clone();
    }
    if let Some(sep) = options.decimal_separator {
        parsing.decimal_separator = sep;
    }
    parsing.thousands_separator = options.thousands_separator;
    if parsing.thousands_separator == Some(parsing.decimal_separator) {
        return Err(ConfigurationError::InvalidOption {
            option: "thousands_separator",
            message: "must differ from the decimal separator".to_string(),
        });
    }
    parsing.ragged_tolerance = options.ragged_tolerance;
    Ok(parsing)
}

fn compile_duplicates(dup: &DuplicateRuleDescriptor) -> Result<DuplicateRule, ConfigurationError> {
    if dup.fields.is_empty() {
        return Err(ConfigurationError::InvalidOption {
            option: "duplicates",
            message: "at least one field is required".to_string(),
        });
    }
    let fields = dup
        .fields
        .iter()
        .map(|name| parse_field(name))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(DuplicateRule {
        fields,
        case_insensitive: dup.case_insensitive,
    })
}
