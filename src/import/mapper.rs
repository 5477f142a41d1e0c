use serde::Serialize;
use std::collections::BTreeMap;
use tracing::warn;

use super::config::ImportConfig;
use super::error::MappingError;
use super::schema::{alias_for, CanonicalField};

/// Where a header's field assignment came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchSource {
    Configured,
    Alias,
    Unmapped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MappingSuggestion {
    pub header: String,
    pub field: Option<CanonicalField>,
    pub source: MatchSource,
}

/// Resolve one header: configured mapping first, then the alias table.
fn match_header(header: &str, config: &ImportConfig) -> (Option<CanonicalField>, MatchSource) {
    if let Some(field) = config.mapping.get(&header.trim().to_lowercase()) {
        return (Some(*field), MatchSource::Configured);
    }
    match alias_for(header) {
        Some(field) => (Some(field), MatchSource::Alias),
        None => (None, MatchSource::Unmapped),
    }
}

/// Per-header suggestions, without failing on missing required fields.
pub fn suggest(headers: &[String], config: &ImportConfig) -> Vec<MappingSuggestion> {
    headers
        .iter()
        .map(|header| {
            let (field, source) = match_header(header, config);
            MappingSuggestion {
                header: header.clone(),
                field,
                source,
            }
        })
        .collect()
}

/// Header columns resolved to canonical fields for one import.
#[derive(Debug, Clone)]
pub struct ColumnMapping {
    columns: BTreeMap<CanonicalField, usize>,
    unmapped: Vec<String>,
}

impl ColumnMapping {
    /// Map `headers` and fail once if any required field has no column.
    pub fn resolve(headers: &[String], config: &ImportConfig) -> Result<Self, MappingError> {
        let mut columns = BTreeMap::new();
        let mut unmapped = Vec::new();

        for (column, header) in headers.iter().enumerate() {
            match match_header(header, config) {
                (Some(field), _) if !columns.contains_key(&field) => {
                    columns.insert(field, column);
                }
                (Some(field), _) => {
                    warn!(
                        "Column '{}' also maps to {}; keeping the first column",
                        header, field
                    );
                    unmapped.push(header.clone());
                }
                (None, _) => unmapped.push(header.clone()),
            }
        }

        let missing: Vec<CanonicalField> = config
            .required
            .iter()
            .filter(|field| !columns.contains_key(*field))
            .copied()
            .collect();
        if !missing.is_empty() {
            return Err(MappingError { missing });
        }

        Ok(Self { columns, unmapped })
    }

    pub fn column_for(&self, field: CanonicalField) -> Option<usize> {
        self.columns.get(&field).copied()
    }

    pub fn unmapped_headers(&self) -> &[String] {
        &self.unmapped
    }
}
