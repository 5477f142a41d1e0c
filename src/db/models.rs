use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::FromRow;

use crate::import::config::ConfigDocuments;
use crate::import::error::{FieldError, ImportFailure, PersistenceError, RowError};
use crate::import::model::ImportJob;

/// Database representation of an import job
#[derive(Debug, FromRow)]
pub struct ImportJobRow {
    pub id: i64,
    pub company_id: i64,
    pub created_by: i64,
    pub file_url: String,
    pub file_size: i64,
    pub file_name: Option<String>,
    pub mapping_config: serde_json::Value,
    pub validation_rules: serde_json::Value,
    pub default_values: serde_json::Value,
    pub options: serde_json::Value,
    pub status: String,
    pub progress: i16,
    pub total_records: i64,
    pub successful_imports: i64,
    pub failed_imports: i64,
    pub skipped_records: i64,
    pub last_error: Option<Json<ImportFailure>>,
    pub claimed_by: Option<String>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub cancel_requested_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<ImportJobRow> for ImportJob {
    type Error = PersistenceError;

    fn try_from(row: ImportJobRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse()
            .map_err(|e| PersistenceError(format!("import job {}: {}", row.id, e)))?;

        Ok(ImportJob {
            id: row.id,
            company_id: row.company_id,
            created_by: row.created_by,
            file_url: row.file_url,
            file_size: row.file_size,
            file_name: row.file_name,
            documents: ConfigDocuments {
                mapping_config: row.mapping_config,
                validation_rules: row.validation_rules,
                default_values: row.default_values,
                options: row.options,
            },
            status,
            progress: row.progress,
            total_records: row.total_records,
            successful_imports: row.successful_imports,
            failed_imports: row.failed_imports,
            skipped_records: row.skipped_records,
            last_error: row.last_error.map(|Json(failure)| failure),
            claimed_by: row.claimed_by,
            heartbeat_at: row.heartbeat_at,
            cancel_requested_at: row.cancel_requested_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            cancelled_at: row.cancelled_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// One entry of `import_row_errors`
#[derive(Debug, FromRow)]
pub struct RowErrorRow {
    pub row_index: i64,
    pub kind: String,
    pub errors: Json<Vec<FieldError>>,
}

impl TryFrom<RowErrorRow> for RowError {
    type Error = PersistenceError;

    fn try_from(row: RowErrorRow) -> Result<Self, Self::Error> {
        Ok(RowError {
            row_index: u64::try_from(row.row_index)
                .map_err(|_| PersistenceError(format!("negative row index {}", row.row_index)))?,
            kind: row.kind.parse().map_err(PersistenceError)?,
            errors: row.errors.0,
        })
    }
}
