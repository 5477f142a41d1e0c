use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Platform job attributes an uploaded column can map onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalField {
    Title,
    Description,
    Location,
    Department,
    EmploymentType,
    ExperienceLevel,
    Remote,
    SalaryMin,
    SalaryMax,
    SalaryCurrency,
    ApplicationDeadline,
    ContactEmail,
    ExternalId,
}

/// Value type a canonical field is parsed into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Text,
    Decimal,
    Boolean,
    Date,
    Email,
}

impl CanonicalField {
    pub const ALL: [CanonicalField; 13] = [
        CanonicalField::Title,
        CanonicalField::Description,
        CanonicalField::Location,
        CanonicalField::Department,
        CanonicalField::EmploymentType,
        CanonicalField::ExperienceLevel,
        CanonicalField::Remote,
        CanonicalField::SalaryMin,
        CanonicalField::SalaryMax,
        CanonicalField::SalaryCurrency,
        CanonicalField::ApplicationDeadline,
        CanonicalField::ContactEmail,
        CanonicalField::ExternalId,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Title => "title",
            Self::Description => "description",
            Self::Location => "location",
            Self::Department => "department",
            Self::EmploymentType => "employment_type",
            Self::ExperienceLevel => "experience_level",
            Self::Remote => "remote",
            Self::SalaryMin => "salary_min",
            Self::SalaryMax => "salary_max",
            Self::SalaryCurrency => "salary_currency",
            Self::ApplicationDeadline => "application_deadline",
            Self::ContactEmail => "contact_email",
            Self::ExternalId => "external_id",
        }
    }

    pub fn field_type(&self) -> FieldType {
        match self {
            Self::Remote => FieldType::Boolean,
            Self::SalaryMin | Self::SalaryMax => FieldType::Decimal,
            Self::ApplicationDeadline => FieldType::Date,
            Self::ContactEmail => FieldType::Email,
            _ => FieldType::Text,
        }
    }

    /// Fields every job needs regardless of tenant configuration.
    pub fn is_intrinsically_required(&self) -> bool {
        matches!(self, Self::Title)
    }
}

impl fmt::Display for CanonicalField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CanonicalField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        CanonicalField::ALL
            .iter()
            .copied()
            .find(|field| field.as_str() == wanted)
            .ok_or_else(|| format!("unknown job field '{}'", s.trim()))
    }
}

/// Built-in synonyms for common spreadsheet headers, already normalized.
const ALIASES: &[(&str, CanonicalField)] = &[
    ("title", CanonicalField::Title),
    ("job title", CanonicalField::Title),
    ("position", CanonicalField::Title),
    ("position title", CanonicalField::Title),
    ("role", CanonicalField::Title),
    ("job name", CanonicalField::Title),
    ("description", CanonicalField::Description),
    ("job description", CanonicalField::Description),
    ("details", CanonicalField::Description),
    ("summary", CanonicalField::Description),
    ("location", CanonicalField::Location),
    ("city", CanonicalField::Location),
    ("office", CanonicalField::Location),
    ("job location", CanonicalField::Location),
    ("department", CanonicalField::Department),
    ("team", CanonicalField::Department),
    ("division", CanonicalField::Department),
    ("employment type", CanonicalField::EmploymentType),
    ("job type", CanonicalField::EmploymentType),
    ("contract type", CanonicalField::EmploymentType),
    ("type", CanonicalField::EmploymentType),
    ("experience level", CanonicalField::ExperienceLevel),
    ("seniority", CanonicalField::ExperienceLevel),
    ("level", CanonicalField::ExperienceLevel),
    ("remote", CanonicalField::Remote),
    ("is remote", CanonicalField::Remote),
    ("remote ok", CanonicalField::Remote),
    ("salary min", CanonicalField::SalaryMin),
    ("min salary", CanonicalField::SalaryMin),
    ("minimum salary", CanonicalField::SalaryMin),
    ("salary from", CanonicalField::SalaryMin),
    ("salary", CanonicalField::SalaryMin),
    ("salary max", CanonicalField::SalaryMax),
    ("max salary", CanonicalField::SalaryMax),
    ("maximum salary", CanonicalField::SalaryMax),
    ("salary to", CanonicalField::SalaryMax),
    ("currency", CanonicalField::SalaryCurrency),
    ("salary currency", CanonicalField::SalaryCurrency),
    ("application deadline", CanonicalField::ApplicationDeadline),
    ("deadline", CanonicalField::ApplicationDeadline),
    ("closing date", CanonicalField::ApplicationDeadline),
    ("apply by", CanonicalField::ApplicationDeadline),
    ("contact email", CanonicalField::ContactEmail),
    ("email", CanonicalField::ContactEmail),
    ("recruiter email", CanonicalField::ContactEmail),
    ("external id", CanonicalField::ExternalId),
    ("reference", CanonicalField::ExternalId),
    ("requisition id", CanonicalField::ExternalId),
    ("req id", CanonicalField::ExternalId),
];

/// Normalize a header for comparison: trimmed, lowercased, `_`/`-` as spaces,
/// inner whitespace collapsed.
pub fn normalize_header(header: &str) -> String {
    header
        .trim()
        .to_lowercase()
        .replace(['_', '-'], " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Look up a header in the built-in alias table.
pub fn alias_for(header: &str) -> Option<CanonicalField> {
    let normalized = normalize_header(header);
    ALIASES
        .iter()
        .find(|(alias, _)| *alias == normalized)
        .map(|(_, field)| *field)
}
