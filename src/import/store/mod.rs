//! Durable state of import jobs.
//!
//! [`ImportJobStore`] is the single source of truth clients poll and workers
//! resume from. `db::import_job_repository` backs it with PostgreSQL;
//! [`MemoryImportJobStore`] keeps everything in process for tests and local runs.

mod memory;

pub use memory::MemoryImportJobStore;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use super::error::{ImportFailure, PersistenceError, RowError};
use super::model::{BatchResult, ImportJob, NewImportJob};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    #[error("import job {0} not found")]
    NotFound(i64),

    #[error("import job {0} is already claimed by another worker")]
    AlreadyClaimed(i64),

    #[error("company {0} already has an import in progress")]
    ImportInProgress(i64),

    #[error("import job {0} is no longer active")]
    Inactive(i64),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// Whether `worker` may still write to `job`.
pub(crate) fn ensure_held(job: &ImportJob, worker: &str) -> Result<(), StoreError> {
    if !job.status.is_active() {
        return Err(StoreError::Inactive(job.id));
    }
    if job.claimed_by.as_deref() != Some(worker) {
        return Err(StoreError::AlreadyClaimed(job.id));
    }
    Ok(())
}

#[async_trait]
pub trait ImportJobStore: Send + Sync {
    /// Insert a `pending` job. Fails with `ImportInProgress` while the company
    /// has a job in `validating` or `processing`.
    async fn create(&self, new_job: NewImportJob) -> Result<ImportJob, StoreError>;

    async fn get(&self, id: i64) -> Result<ImportJob, StoreError>;

    /// `get` scoped to the owning company; other tenants see `NotFound`.
    async fn get_for_company(&self, company_id: i64, id: i64) -> Result<ImportJob, StoreError> {
        let job = self.get(id).await?;
        if job.company_id != company_id {
            return Err(StoreError::NotFound(id));
        }
        Ok(job)
    }

    /// Most recent imports of a company, newest first.
    async fn list_for_company(&self, company_id: i64, limit: i64) -> Result<Vec<ImportJob>, StoreError>;

    /// Jobs a worker could claim right now: unclaimed `pending` jobs and
    /// active jobs whose holder stopped heartbeating for longer than `lease`.
    /// A pending job waits while its company has an active job or an older
    /// pending one.
    async fn list_claimable(&self, lease: Duration, limit: i64) -> Result<Vec<i64>, StoreError>;

    /// Take exclusive ownership of a job. A `pending` job moves to
    /// `validating`; an orphaned active job keeps its status and counters.
    /// A pending job that has to wait for its company's other imports fails
    /// with `ImportInProgress`.
    async fn claim(&self, id: i64, worker: &str, lease: Duration) -> Result<ImportJob, StoreError>;

    /// Give up ownership without changing status, so another worker can resume.
    async fn release(&self, id: i64, worker: &str) -> Result<(), StoreError>;

    // The writes below are fenced on the claim: a worker whose lease was taken
    // over gets `AlreadyClaimed`, a job that already finished gives `Inactive`.

    async fn set_total_records(&self, id: i64, worker: &str, total: i64) -> Result<ImportJob, StoreError>;

    async fn mark_processing(&self, id: i64, worker: &str) -> Result<ImportJob, StoreError>;

    /// Commit a batch: create its jobs, record its row errors, increment the
    /// counters and raise progress, all in one unit. `offset` is the number of
    /// rows the batch starts after; a commit whose offset no longer matches the
    /// stored counters is rejected. Progress never decreases.
    async fn apply_batch_result(
        &self,
        id: i64,
        worker: &str,
        offset: i64,
        batch: &BatchResult,
    ) -> Result<ImportJob, StoreError>;

    /// Flag an active job for cancellation. Other states are returned unchanged.
    async fn request_cancel(&self, id: i64) -> Result<ImportJob, StoreError>;

    async fn complete(&self, id: i64, worker: &str) -> Result<ImportJob, StoreError>;

    async fn fail(&self, id: i64, worker: &str, failure: &ImportFailure) -> Result<ImportJob, StoreError>;

    async fn cancel(&self, id: i64, worker: &str) -> Result<ImportJob, StoreError>;

    /// Fail every active job started more than `max_duration` ago.
    async fn fail_timed_out(&self, max_duration: Duration) -> Result<Vec<i64>, StoreError>;

    async fn row_errors(&self, id: i64) -> Result<Vec<RowError>, StoreError>;
}
