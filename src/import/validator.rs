use chrono::NaiveDate;
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};

use super::config::{FieldValue, ImportConfig};
use super::error::{FieldError, RowError};
use super::mapper::ColumnMapping;
use super::parser::{Cell, RawRow};
use super::schema::{CanonicalField, FieldType};

/// A row that passed validation, with every mapped field typed.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedRecord {
    pub row_index: u64,
    pub values: BTreeMap<CanonicalField, FieldValue>,
}

impl ValidatedRecord {
    pub fn get(&self, field: CanonicalField) -> Option<&FieldValue> {
        self.values.get(&field)
    }

    pub fn text(&self, field: CanonicalField) -> Option<String> {
        self.get(field).and_then(FieldValue::as_text).map(str::to_string)
    }

    pub fn decimal(&self, field: CanonicalField) -> Option<f64> {
        self.get(field).and_then(FieldValue::as_decimal)
    }

    pub fn boolean(&self, field: CanonicalField) -> Option<bool> {
        self.get(field).and_then(FieldValue::as_bool)
    }

    pub fn date(&self, field: CanonicalField) -> Option<NaiveDate> {
        self.get(field).and_then(FieldValue::as_date)
    }
}

/// What became of one input row.
#[derive(Debug, Clone, PartialEq)]
pub enum RowOutcome {
    Valid(ValidatedRecord),
    Invalid(RowError),
    Duplicate(RowError),
}

/// Applies mapping, defaults and rules to rows of one import.
///
/// Holds the duplicate-key index, so rows must be fed in file order.
pub struct RowValidator<'a> {
    config: &'a ImportConfig,
    mapping: &'a ColumnMapping,
    seen: HashMap<String, u64>,
}

impl<'a> RowValidator<'a> {
    pub fn new(config: &'a ImportConfig, mapping: &'a ColumnMapping) -> Self {
        Self {
            config,
            mapping,
            seen: HashMap::new(),
        }
    }

    pub fn validate(&mut self, row: &RawRow) -> RowOutcome {
        let record = match self.check(row) {
            Ok(record) => record,
            Err(err) => return RowOutcome::Invalid(err),
        };

        if let Some(first_row) = self.remember(&record) {
            let fields = self
                .config
                .duplicates
                .as_ref()
                .map_or(&[][..], |rule| rule.fields.as_slice());
            return RowOutcome::Duplicate(RowError::duplicate(record.row_index, first_row, fields));
        }

        RowOutcome::Valid(record)
    }

    /// Replay rows that were already accounted for in an earlier run so the
    /// duplicate index matches an uninterrupted pass.
    pub fn prime<I>(&mut self, rows: I)
    where
        I: IntoIterator<Item = RawRow>,
    {
        if self.config.duplicates.is_none() {
            return;
        }
        for row in rows {
            if let Ok(record) = self.check(&row) {
                self.remember(&record);
            }
        }
    }

    /// Record the duplicate key of a valid row. Returns the earlier row that
    /// already holds the key, if any.
    fn remember(&mut self, record: &ValidatedRecord) -> Option<u64> {
        let rule = self.config.duplicates.as_ref()?;
        let key = duplicate_key(record, &rule.fields, rule.case_insensitive);
        match self.seen.entry(key) {
            Entry::Occupied(first) => Some(*first.get()),
            Entry::Vacant(slot) => {
                slot.insert(record.row_index);
                None
            }
        }
    }

    fn check(&self, row: &RawRow) -> Result<ValidatedRecord, RowError> {
        let mut values = BTreeMap::new();
        let mut errors = Vec::new();

        for field in CanonicalField::ALL {
            let cell = self
                .mapping
                .column_for(field)
                .and_then(|column| row.cell(column))
                .filter(|cell| !cell.is_blank());

            let validator = self.config.validators.get(&field);
            let value = match cell {
                Some(Cell::Date(date)) if field.field_type() == FieldType::Date => FieldValue::Date(*date),
                Some(cell) => {
                    let date_format = validator.and_then(|v| v.date_format());
                    match self.config.parsing.parse_value(field, &cell.text(), date_format) {
                        Ok(value) => value,
                        Err(reason) => {
                            errors.push(FieldError::new(field.as_str(), reason));
                            continue;
                        }
                    }
                }
                None if self.config.is_required(field) => {
                    errors.push(FieldError::new(field.as_str(), "required value is missing"));
                    continue;
                }
                None => match self.config.defaults.get(&field) {
                    Some(default) => default.clone(),
                    None => continue,
                },
            };

            if let Some(validator) = validator {
                for reason in validator.violations(&value) {
                    errors.push(FieldError::new(field.as_str(), reason));
                }
            }
            values.insert(field, value);
        }

        let salary = (
            values.get(&CanonicalField::SalaryMin).and_then(FieldValue::as_decimal),
            values.get(&CanonicalField::SalaryMax).and_then(FieldValue::as_decimal),
        );
        if let (Some(min), Some(max)) = salary {
            if min > max {
                errors.push(FieldError::new(
                    CanonicalField::SalaryMax.as_str(),
                    format!("{} is below salary_min {}", max, min),
                ));
            }
        }

        if errors.is_empty() {
            Ok(ValidatedRecord {
                row_index: row.row_index,
                values,
            })
        } else {
            Err(RowError::invalid(row.row_index, errors))
        }
    }
}

fn duplicate_key(record: &ValidatedRecord, fields: &[CanonicalField], case_insensitive: bool) -> String {
    let key = fields
        .iter()
        .map(|field| record.get(*field).map(FieldValue::key_text).unwrap_or_default())
        .collect::<Vec<_>>()
        .join("\u{1f}");
    if case_insensitive {
        key.to_lowercase()
    } else {
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::import::config::ConfigDocuments;
    use crate::import::error::RowErrorKind;
    use crate::import::parser::ParsedSheet;
    use assert_matches::assert_matches;
    use serde_json::json;

    struct Fixture {
        config: ImportConfig,
        sheet: ParsedSheet,
        mapping: ColumnMapping,
    }

    fn fixture(csv: &str, docs: ConfigDocuments) -> Fixture {
        let config = ImportConfig::from_documents(&docs).unwrap();
        let sheet = ParsedSheet::parse(csv.as_bytes(), &config.parsing).unwrap();
        let mapping = ColumnMapping::resolve(sheet.headers(), &config).unwrap();
        Fixture { config, sheet, mapping }
    }

    fn outcomes(f: &Fixture) -> Vec<RowOutcome> {
        let mut validator = RowValidator::new(&f.config, &f.mapping);
        f.sheet.rows_from(0).map(|row| validator.validate(&row)).collect()
    }

    #[test]
    fn fills_defaults_and_types_values() {
        let f = fixture(
            "Title,Remote,Min Salary,Deadline\nEngineer,yes,\"55000\",2025-03-01\nDesigner,,,\n",
            ConfigDocuments {
                default_values: json!({"remote": "false", "salary_currency": "EUR"}),
                ..ConfigDocuments::default()
            },
        );
        let results = outcomes(&f);

        let first = assert_matches!(&results[0], RowOutcome::Valid(r) => r);
        assert_eq!(first.boolean(CanonicalField::Remote), Some(true));
        assert_eq!(first.decimal(CanonicalField::SalaryMin), Some(55000.0));
        assert_eq!(
            first.date(CanonicalField::ApplicationDeadline),
            NaiveDate::from_ymd_opt(2025, 3, 1)
        );
        assert_eq!(first.text(CanonicalField::SalaryCurrency).as_deref(), Some("EUR"));

        let second = assert_matches!(&results[1], RowOutcome::Valid(r) => r);
        assert_eq!(second.boolean(CanonicalField::Remote), Some(false));
        assert_eq!(second.get(CanonicalField::SalaryMin), None);
    }

    #[test]
    fn missing_required_value_names_field_and_row() {
        let f = fixture(
            "Title,Location\nEngineer,\n",
            ConfigDocuments {
                validation_rules: json!({"location": [{"kind": "required"}]}),
                ..ConfigDocuments::default()
            },
        );
        let err = assert_matches!(&outcomes(&f)[0], RowOutcome::Invalid(e) => e.clone());
        assert_eq!(err.row_index, 0);
        assert_eq!(err.kind, RowErrorKind::Invalid);
        assert!(err.mentions(CanonicalField::Location));
    }

    #[test]
    fn aggregates_all_violations_of_a_row() {
        let f = fixture(
            "Title,Min Salary,Email,Type\nX,-10,not-an-email,temp\n",
            ConfigDocuments {
                validation_rules: json!({
                    "title": [{"kind": "length", "min": 2}],
                    "salary_min": [{"kind": "range", "min": 0}],
                    "employment_type": [{"kind": "enum", "values": ["full-time", "contract"]}]
                }),
                ..ConfigDocuments::default()
            },
        );
        let err = assert_matches!(&outcomes(&f)[0], RowOutcome::Invalid(e) => e.clone());
        assert_eq!(err.errors.len(), 4);
        for field in [
            CanonicalField::Title,
            CanonicalField::SalaryMin,
            CanonicalField::ContactEmail,
            CanonicalField::EmploymentType,
        ] {
            assert!(err.mentions(field), "expected error for {}", field);
        }
    }

    #[test]
    fn uses_explicit_date_format() {
        let f = fixture(
            "Title,Deadline\nA,31/12/2025\nB,2025-12-31\n",
            ConfigDocuments {
                validation_rules: json!({"application_deadline": [{"kind": "type", "format": "%d/%m/%Y"}]}),
                ..ConfigDocuments::default()
            },
        );
        let results = outcomes(&f);
        assert_matches!(&results[0], RowOutcome::Valid(_));
        assert_matches!(&results[1], RowOutcome::Invalid(e) if e.mentions(CanonicalField::ApplicationDeadline));
    }

    #[test]
    fn spreadsheet_date_cells_bypass_the_text_format() {
        let f = fixture(
            "Title,Deadline,Department\nA,31/01/2030,Sales\n",
            ConfigDocuments {
                validation_rules: json!({"application_deadline": [{"kind": "type", "format": "%d/%m/%Y"}]}),
                ..ConfigDocuments::default()
            },
        );
        let date = NaiveDate::from_ymd_opt(2030, 1, 31).unwrap();
        let row = RawRow::new(0, vec![Cell::from("Engineer"), Cell::Date(date), Cell::Date(date)]);

        let mut validator = RowValidator::new(&f.config, &f.mapping);
        let record = assert_matches!(validator.validate(&row), RowOutcome::Valid(r) => r);
        assert_eq!(record.date(CanonicalField::ApplicationDeadline), Some(date));
        assert_eq!(record.text(CanonicalField::Department).as_deref(), Some("2030-01-31"));
    }

    #[test]
    fn priming_skips_invalid_rows() {
        let f = fixture(
            "Title,Location\n,Berlin\nEngineer,Berlin\n",
            ConfigDocuments {
                options: json!({"duplicates": {"fields": ["location"]}}),
                ..ConfigDocuments::default()
            },
        );
        let mut validator = RowValidator::new(&f.config, &f.mapping);
        validator.prime(f.sheet.rows_from(0).take(1));
        let resumed: Vec<_> = f.sheet.rows_from(1).map(|row| validator.validate(&row)).collect();
        assert_matches!(&resumed[0], RowOutcome::Valid(_));
    }

    #[test]
    fn salary_range_must_be_ordered() {
        let f = fixture("Title,Min Salary,Max Salary\nA,900,100\n", ConfigDocuments::default());
        assert_matches!(&outcomes(&f)[0], RowOutcome::Invalid(e) if e.mentions(CanonicalField::SalaryMax));
    }

    #[test]
    fn later_duplicates_are_skipped() {
        let f = fixture(
            "Title,Location\nEngineer,Berlin\nengineer,BERLIN\nEngineer,Paris\nEngineer,Berlin\n",
            ConfigDocuments {
                options: json!({"duplicates": {"fields": ["title", "location"], "case_insensitive": true}}),
                ..ConfigDocuments::default()
            },
        );
        let results = outcomes(&f);
        assert_matches!(&results[0], RowOutcome::Valid(_));
        let dup = assert_matches!(&results[1], RowOutcome::Duplicate(e) => e.clone());
        assert_eq!(dup.kind, RowErrorKind::Duplicate);
        assert!(dup.errors[0].reason.contains("row 0"));
        assert_matches!(&results[2], RowOutcome::Valid(_));
        assert_matches!(&results[3], RowOutcome::Duplicate(_));
    }

    #[test]
    fn priming_restores_duplicate_index() {
        let f = fixture(
            "Title,Location\nEngineer,Berlin\nDesigner,Paris\nEngineer,Berlin\n",
            ConfigDocuments {
                options: json!({"duplicates": {"fields": ["title", "location"]}}),
                ..ConfigDocuments::default()
            },
        );
        let mut validator = RowValidator::new(&f.config, &f.mapping);
        validator.prime(f.sheet.rows_from(0).take(2));
        let resumed: Vec<_> = f.sheet.rows_from(2).map(|row| validator.validate(&row)).collect();
        assert_matches!(&resumed[0], RowOutcome::Duplicate(_));
    }

    #[test]
    fn outcomes_are_deterministic() {
        let f = fixture(
            "Title,Min Salary,Deadline\nA,-1,2025-01-01\nB,abc,bad\nC,5,2025-02-30\n",
            ConfigDocuments {
                validation_rules: json!({"salary_min": [{"kind": "range", "min": 0}]}),
                ..ConfigDocuments::default()
            },
        );
        assert_eq!(outcomes(&f), outcomes(&f));
    }
}
