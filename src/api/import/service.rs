use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::api::validation::ErrorResponse;
use crate::import::config::{ConfigDocuments, ImportConfig};
use crate::import::error::{ConfigurationError, RowError};
use crate::import::mapper::{self, ColumnMapping};
use crate::import::model::{ImportJob, ImportStatus, NewImportJob};
use crate::import::source::LocalFileStore;
use crate::import::store::{ImportJobStore, StoreError};
use crate::worker::CancellationRegistry;
use super::dto::{CreateImportRequest, PreviewMappingRequest, PreviewMappingResponse, UploadImportForm};

/// Largest page of imports a list request may ask for.
pub const MAX_LIST_LIMIT: i64 = 100;
pub const DEFAULT_LIST_LIMIT: i64 = 20;

/// Service-level errors
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Import not found: {0}")]
    NotFound(i64),

    #[error("Company {0} already has an import in progress")]
    ImportInProgress(i64),

    #[error("Invalid import configuration: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("File is {size} bytes; the limit is {limit} bytes")]
    FileTooLarge { size: u64, limit: u64 },

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Import {id} cannot be cancelled while {status}")]
    InvalidState { id: i64, status: ImportStatus },

    #[error("File storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => ServiceError::NotFound(id),
            StoreError::ImportInProgress(company_id) => ServiceError::ImportInProgress(company_id),
            other => ServiceError::Store(other),
        }
    }
}

impl ResponseError for ServiceError {
    fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::ImportInProgress(_) | ServiceError::InvalidState { .. } => StatusCode::CONFLICT,
            ServiceError::Configuration(_) | ServiceError::ValidationError(_) => StatusCode::BAD_REQUEST,
            ServiceError::FileTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ServiceError::Storage(_) | ServiceError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let (error, fields) = match self {
            ServiceError::NotFound(id) => {
                warn!("Import not found: {}", id);
                (
                    "Not found",
                    serde_json::json!({"message": format!("Import with id {} not found", id)}),
                )
            }
            ServiceError::ImportInProgress(company_id) => {
                warn!("Rejected import for company {}: one is already running", company_id);
                ("Import in progress", serde_json::json!({"message": self.to_string()}))
            }
            ServiceError::Configuration(e) => {
                warn!("Configuration error: {}", e);
                ("Invalid configuration", serde_json::json!({"message": e.to_string()}))
            }
            ServiceError::FileTooLarge { size, limit } => {
                warn!("Rejected {} byte file (limit {})", size, limit);
                ("File too large", serde_json::json!({"size": size, "limit": limit}))
            }
            ServiceError::ValidationError(msg) => {
                warn!("Validation error: {}", msg);
                ("Validation failed", serde_json::json!({"message": msg}))
            }
            ServiceError::InvalidState { id, status } => {
                warn!("Import {} cannot be cancelled while {}", id, status);
                (
                    "Invalid import state",
                    serde_json::json!({"message": self.to_string(), "status": status}),
                )
            }
            ServiceError::Storage(e) => {
                error!("File storage error: {}", e);
                ("Failed to process request", serde_json::json!({"message": "File storage error occurred"}))
            }
            ServiceError::Store(e) => {
                error!("Store error: {}", e);
                ("Failed to process request", serde_json::json!({"message": "Database error occurred"}))
            }
        };

        HttpResponse::build(self.status_code()).json(ErrorResponse {
            error: error.to_string(),
            fields,
        })
    }
}

/// Import service containing the request-side business logic
pub struct ImportService {
    store: Arc<dyn ImportJobStore>,
    files: LocalFileStore,
    registry: Arc<CancellationRegistry>,
    max_file_size: u64,
}

impl ImportService {
    pub fn new(
        store: Arc<dyn ImportJobStore>,
        files: LocalFileStore,
        registry: Arc<CancellationRegistry>,
        max_file_size: u64,
    ) -> Self {
        Self {
            store,
            files,
            registry,
            max_file_size,
        }
    }

    /// Create a `pending` import for a file that is already stored.
    ///
    /// The configuration is compiled eagerly so a broken one is rejected here
    /// instead of failing the job later.
    pub async fn create_import(
        &self,
        company_id: i64,
        request: &CreateImportRequest,
    ) -> Result<ImportJob, ServiceError> {
        info!("Service: Creating import for company {} from {}", company_id, request.file_url);
        self.check_size(request.file_size as u64)?;

        let documents = request.documents();
        ImportConfig::from_documents(&documents)?;

        let job = self
            .store
            .create(NewImportJob {
                company_id,
                created_by: request.created_by,
                file_url: request.file_url.clone(),
                file_size: request.file_size,
                file_name: request.file_name.clone(),
                documents,
            })
            .await?;

        info!("Service: Import {} created for company {}", job.id, company_id);
        Ok(job)
    }

    /// Keep an uploaded file in the local store, then create its import.
    pub async fn upload_import(&self, company_id: i64, form: UploadImportForm) -> Result<ImportJob, ServiceError> {
        self.check_size(form.file.size as u64)?;

        let documents = match &form.config {
            Some(raw) if !raw.trim().is_empty() => serde_json::from_str::<ConfigDocuments>(raw)
                .map_err(|e| ServiceError::ValidationError(format!("config is not valid JSON: {}", e)))?,
            _ => ConfigDocuments::default(),
        };
        ImportConfig::from_documents(&documents)?;

        let created_by = *form.created_by;
        if created_by < 1 {
            return Err(ServiceError::ValidationError(
                "created_by must be a positive user id".to_string(),
            ));
        }

        let file_name = form.file.file_name.clone();
        let stored = self
            .files
            .store(
                company_id,
                file_name.as_deref().unwrap_or("upload"),
                form.file.file.path(),
            )
            .await?;
        info!("Service: Stored {} byte upload for company {}", stored.size, company_id);

        let job = self
            .store
            .create(NewImportJob {
                company_id,
                created_by,
                file_url: stored.url.clone(),
                file_size: stored.size,
                file_name,
                documents,
            })
            .await;

        match job {
            Ok(job) => Ok(job),
            Err(e) => {
                // The import was never created; nothing will read the copy.
                discard(&stored.url).await;
                Err(e.into())
            }
        }
    }

    pub async fn get_import(&self, company_id: i64, id: i64) -> Result<ImportJob, ServiceError> {
        Ok(self.store.get_for_company(company_id, id).await?)
    }

    pub async fn list_imports(&self, company_id: i64, limit: Option<i64>) -> Result<Vec<ImportJob>, ServiceError> {
        let limit = limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
        Ok(self.store.list_for_company(company_id, limit).await?)
    }

    pub async fn row_errors(&self, company_id: i64, id: i64) -> Result<Vec<RowError>, ServiceError> {
        self.store.get_for_company(company_id, id).await?;
        Ok(self.store.row_errors(id).await?)
    }

    /// Request cancellation of a running import.
    ///
    /// Terminal imports are returned unchanged. Pending imports have not
    /// started and cannot be cancelled.
    pub async fn cancel_import(&self, company_id: i64, id: i64) -> Result<ImportJob, ServiceError> {
        let job = self.store.get_for_company(company_id, id).await?;
        match job.status {
            ImportStatus::Pending => Err(ServiceError::InvalidState { id, status: job.status }),
            status if status.is_terminal() => {
                info!("Service: Import {} already {}, cancel is a no-op", id, status);
                Ok(job)
            }
            _ => {
                let job = self.store.request_cancel(id).await?;
                let local = self.registry.cancel(id);
                info!(
                    "Service: Cancellation requested for import {} (running here: {})",
                    id, local
                );
                Ok(job)
            }
        }
    }

    /// Suggest a field for each header without creating anything.
    pub fn preview_mapping(&self, request: &PreviewMappingRequest) -> Result<PreviewMappingResponse, ServiceError> {
        let config = ImportConfig::from_documents(&ConfigDocuments {
            mapping_config: request.mapping_config.clone(),
            validation_rules: request.validation_rules.clone(),
            ..ConfigDocuments::default()
        })?;

        let missing_required = match ColumnMapping::resolve(&request.headers, &config) {
            Ok(_) => Vec::new(),
            Err(e) => e.missing,
        };

        Ok(PreviewMappingResponse {
            suggestions: mapper::suggest(&request.headers, &config),
            missing_required,
        })
    }

    fn check_size(&self, size: u64) -> Result<(), ServiceError> {
        if size > self.max_file_size {
            return Err(ServiceError::FileTooLarge {
                size,
                limit: self.max_file_size,
            });
        }
        Ok(())
    }
}

async fn discard(url: &str) {
    if let Some(path) = url.strip_prefix("file://") {
        if let Err(e) = tokio::fs::remove_file(Path::new(path)).await {
            warn!("Could not remove unused upload {}: {}", path, e);
        }
    }
}
