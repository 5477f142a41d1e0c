use actix_multipart::form::{tempfile::TempFile, text::Text, MultipartForm};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::import::config::ConfigDocuments;
use crate::import::error::{ImportFailure, RowError};
use crate::import::mapper::MappingSuggestion;
use crate::import::model::{ImportJob, ImportStatus};
use crate::import::schema::CanonicalField;

/// Body of `POST /companies/{company_id}/imports`
#[derive(Debug, Deserialize, Serialize, Validate)]
pub struct CreateImportRequest {
    #[validate(range(min = 1, message = "created_by must be a positive user id"))]
    pub created_by: i64,

    #[validate(length(min = 1, max = 2048, message = "file_url must be between 1 and 2048 characters"))]
    pub file_url: String,

    #[validate(range(min = 0, message = "file_size cannot be negative"))]
    pub file_size: i64,

    #[validate(length(max = 255, message = "file_name must be at most 255 characters"))]
    pub file_name: Option<String>,

    #[serde(default)]
    pub mapping_config: serde_json::Value,
    #[serde(default)]
    pub validation_rules: serde_json::Value,
    #[serde(default)]
    pub default_values: serde_json::Value,
    #[serde(default)]
    pub options: serde_json::Value,
}

impl CreateImportRequest {
    pub fn documents(&self) -> ConfigDocuments {
        ConfigDocuments {
            mapping_config: self.mapping_config.clone(),
            validation_rules: self.validation_rules.clone(),
            default_values: self.default_values.clone(),
            options: self.options.clone(),
        }
    }
}

/// Multipart body of `POST /companies/{company_id}/imports/upload`
///
/// `config` is an optional JSON object with the same
/// `mapping_config`/`validation_rules`/`default_values`/`options` keys as the
/// JSON create request.
#[derive(Debug, MultipartForm)]
pub struct UploadImportForm {
    pub file: TempFile,
    pub created_by: Text<i64>,
    pub config: Option<Text<String>>,
}

/// Response for import creation
#[derive(Debug, Serialize, Deserialize)]
pub struct ImportCreatedResponse {
    pub message: String,
    pub id: i64,
    pub status: ImportStatus,
}

/// Client view of an import job
#[derive(Debug, Serialize, Deserialize)]
pub struct ImportJobResponse {
    pub id: i64,
    pub company_id: i64,
    pub created_by: i64,
    pub file_name: Option<String>,
    pub file_size: i64,
    pub status: ImportStatus,
    pub progress: i16,
    pub total_records: i64,
    pub successful_imports: i64,
    pub failed_imports: i64,
    pub skipped_records: i64,
    pub last_error: Option<ImportFailure>,
    pub cancel_requested: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&ImportJob> for ImportJobResponse {
    fn from(job: &ImportJob) -> Self {
        Self {
            id: job.id,
            company_id: job.company_id,
            created_by: job.created_by,
            file_name: job.file_name.clone(),
            file_size: job.file_size,
            status: job.status,
            progress: job.progress,
            total_records: job.total_records,
            successful_imports: job.successful_imports,
            failed_imports: job.failed_imports,
            skipped_records: job.skipped_records,
            last_error: job.last_error.clone(),
            cancel_requested: job.cancel_requested_at.is_some(),
            started_at: job.started_at,
            completed_at: job.completed_at,
            cancelled_at: job.cancelled_at,
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ImportListResponse {
    pub imports: Vec<ImportJobResponse>,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RowErrorsResponse {
    pub import_job_id: i64,
    pub errors: Vec<RowError>,
}

/// Body of `POST /imports/preview-mapping`
#[derive(Debug, Deserialize, Serialize, Validate)]
pub struct PreviewMappingRequest {
    #[validate(length(min = 1, max = 500, message = "headers must contain between 1 and 500 entries"))]
    pub headers: Vec<String>,

    #[serde(default)]
    pub mapping_config: serde_json::Value,
    #[serde(default)]
    pub validation_rules: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct PreviewMappingResponse {
    pub suggestions: Vec<MappingSuggestion>,
    /// Required fields no header resolves to; an import with these headers
    /// would fail with a mapping error.
    pub missing_required: Vec<CanonicalField>,
}
