//! Drives one import job from `validating` to a terminal state.
//!
//! ```text
//! pending ──claim──► validating ──first batch──► processing ──► completed
//!                        │                           │
//!                        └──► failed ◄───────────────┤
//!                                       cancelled ◄──┘
//! ```
//!
//! The persisted counters are the only cursor: a job picked up again after a
//! crash resumes at `successful + failed + skipped` and never revisits a row
//! that was already accounted for. Every batch is committed together with its
//! counter increments, so that cursor always matches what was written. Every
//! write names the worker and, for batches, the row offset it starts at, so a
//! worker whose claim was taken over cannot write behind its successor.

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::{ConfigDocuments, ImportConfig, DEFAULT_BATCH_SIZE};
use super::error::{FailureKind, ImportFailure};
use super::mapper::ColumnMapping;
use super::model::{BatchResult, ImportJob, ImportStatus, NewJob};
use super::parser::{ParsedSheet, RawRow};
use super::source::FileSource;
use super::store::{ImportJobStore, StoreError};
use super::validator::{RowOutcome, RowValidator};

/// Tuning knobs shared by every run.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    /// Rows per batch when the job's options don't set one.
    pub default_batch_size: usize,
    /// Extra commit attempts after a persistence failure.
    pub persistence_retries: u32,
    /// Base delay of the exponential retry backoff.
    pub retry_backoff: Duration,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            default_batch_size: DEFAULT_BATCH_SIZE,
            persistence_retries: 3,
            retry_backoff: Duration::from_millis(200),
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed(ImportJob),
    Failed(ImportJob),
    Cancelled(ImportJob),
    /// Stopped for shutdown at a batch boundary; the job stays active and is
    /// resumed by the next worker that claims it.
    Suspended(ImportJob),
    /// Someone else moved the job out of an active state (e.g. the timeout
    /// sweep) or took over the claim.
    Abandoned(ImportJob),
}

impl RunOutcome {
    pub fn job(&self) -> &ImportJob {
        match self {
            RunOutcome::Completed(job)
            | RunOutcome::Failed(job)
            | RunOutcome::Cancelled(job)
            | RunOutcome::Suspended(job)
            | RunOutcome::Abandoned(job) => job,
        }
    }
}

/// Signals a run checks between batches.
#[derive(Debug, Clone, Default)]
pub struct RunSignals {
    /// User cancellation of this job.
    pub cancel: CancellationToken,
    /// Process shutdown; the job is suspended, not cancelled.
    pub shutdown: CancellationToken,
}

struct Prepared {
    config: ImportConfig,
    sheet: ParsedSheet,
    mapping: ColumnMapping,
}

pub struct BatchExecutor {
    store: Arc<dyn ImportJobStore>,
    files: Arc<dyn FileSource>,
    settings: ExecutorSettings,
}

impl BatchExecutor {
    pub fn new(store: Arc<dyn ImportJobStore>, files: Arc<dyn FileSource>, settings: ExecutorSettings) -> Self {
        Self { store, files, settings }
    }

    /// Run a job this worker has claimed.
    pub async fn run(&self, job: ImportJob, worker: &str, signals: &RunSignals) -> Result<RunOutcome, StoreError> {
        let id = job.id;
        info!(
            "Import {}: starting (status={}, company={}, processed={})",
            id,
            job.status,
            job.company_id,
            job.processed_rows()
        );

        let Prepared { config, sheet, mapping } = match self.prepare(&job).await {
            Ok(prepared) => prepared,
            Err(failure) => {
                warn!("Import {}: {}", id, failure.message);
                return self.fail(id, worker, &failure).await;
            }
        };

        let total = sheet.total_records() as i64;
        let mut job = match self.store.set_total_records(id, worker, total).await {
            Ok(job) => job,
            Err(e) if lost_claim(&e) => return self.abandoned(id).await,
            Err(e) => return Err(e),
        };

        let offset = u64::try_from(job.processed_rows()).unwrap_or(0);
        let mut validator = RowValidator::new(&config, &mapping);
        if offset > 0 {
            info!("Import {}: resuming at row {} of {}", id, offset, total);
            validator.prime(sheet.rows_from(0).take(offset as usize));
        }
        if !mapping.unmapped_headers().is_empty() {
            debug!("Import {}: ignoring columns {:?}", id, mapping.unmapped_headers());
        }

        let batch_size = config.batch_size_or(self.settings.default_batch_size).max(1);
        let mut rows = sheet.rows_from(offset).peekable();
        while rows.peek().is_some() {
            if let Some(outcome) = self.checkpoint(id, worker, signals).await? {
                return Ok(outcome);
            }

            let chunk: Vec<RawRow> = rows.by_ref().take(batch_size).collect();
            let batch = build_batch(&job, &mut validator, &chunk);

            if job.status == ImportStatus::Validating {
                job = match self.store.mark_processing(id, worker).await {
                    Ok(job) => job,
                    Err(e) if lost_claim(&e) => return self.abandoned(id).await,
                    Err(e) => return Err(e),
                };
            }

            job = match self.commit(id, worker, job.processed_rows(), batch).await {
                Ok(job) => job,
                Err(e) if lost_claim(&e) => return self.abandoned(id).await,
                Err(e) => return Err(e),
            };
            debug!(
                "Import {}: committed rows {}..{} (progress {}%)",
                id,
                chunk.first().map_or(0, |r| r.row_index),
                chunk.last().map_or(0, |r| r.row_index),
                job.progress
            );
        }

        match self.store.complete(id, worker).await {
            Ok(job) => {
                info!(
                    "Import {}: completed ({} created, {} failed, {} skipped of {})",
                    id, job.successful_imports, job.failed_imports, job.skipped_records, job.total_records
                );
                Ok(RunOutcome::Completed(job))
            }
            Err(e) if lost_claim(&e) => self.abandoned(id).await,
            Err(e) => Err(e),
        }
    }

    /// Build everything that can fail the whole file before a batch is written.
    async fn prepare(&self, job: &ImportJob) -> Result<Prepared, ImportFailure> {
        let config = compile_config(&job.documents)?;
        let bytes = self
            .files
            .fetch(&job.file_url)
            .await
            .map_err(|e| ImportFailure::from(&e))?;
        let sheet = ParsedSheet::parse(&bytes, &config.parsing).map_err(|e| ImportFailure::from(&e))?;
        let mapping = ColumnMapping::resolve(sheet.headers(), &config).map_err(|e| ImportFailure::from(&e))?;
        Ok(Prepared { config, sheet, mapping })
    }

    /// Batch-boundary check for cancellation, shutdown and outside changes.
    async fn checkpoint(&self, id: i64, worker: &str, signals: &RunSignals) -> Result<Option<RunOutcome>, StoreError> {
        let current = self.store.get(id).await?;
        if !current.status.is_active() {
            warn!("Import {}: no longer active ({}), stopping", id, current.status);
            return Ok(Some(RunOutcome::Abandoned(current)));
        }
        if current.claimed_by.as_deref() != Some(worker) {
            warn!("Import {}: claim moved to {:?}, stopping", id, current.claimed_by);
            return Ok(Some(RunOutcome::Abandoned(current)));
        }

        if signals.cancel.is_cancelled() || current.cancel_requested_at.is_some() {
            return match self.store.cancel(id, worker).await {
                Ok(job) => {
                    info!(
                        "Import {}: cancelled after {} of {} rows",
                        id,
                        job.processed_rows(),
                        job.total_records
                    );
                    Ok(Some(RunOutcome::Cancelled(job)))
                }
                Err(e) if lost_claim(&e) => self.abandoned(id).await.map(Some),
                Err(e) => Err(e),
            };
        }

        if signals.shutdown.is_cancelled() {
            self.store.release(id, worker).await?;
            info!("Import {}: suspended for shutdown at row {}", id, current.processed_rows());
            return Ok(Some(RunOutcome::Suspended(current)));
        }

        Ok(None)
    }

    /// Commit with bounded retries; a batch that still cannot be written is
    /// recorded with all of its rows failed.
    async fn commit(&self, id: i64, worker: &str, offset: i64, batch: BatchResult) -> Result<ImportJob, StoreError> {
        match self.commit_with_retry(id, worker, offset, &batch).await {
            Err(StoreError::Persistence(err)) => {
                error!("Import {}: giving up on batch after retries: {}", id, err);
                let failure = ImportFailure::new(FailureKind::Persistence, err.to_string());
                let failed = batch.into_failed(&failure);
                self.commit_with_retry(id, worker, offset, &failed).await
            }
            other => other,
        }
    }

    async fn commit_with_retry(
        &self,
        id: i64,
        worker: &str,
        offset: i64,
        batch: &BatchResult,
    ) -> Result<ImportJob, StoreError> {
        let mut attempt = 0;
        loop {
            match self.store.apply_batch_result(id, worker, offset, batch).await {
                Err(StoreError::Persistence(err)) if attempt < self.settings.persistence_retries => {
                    attempt += 1;
                    let delay = backoff(self.settings.retry_backoff, attempt);
                    warn!(
                        "Import {}: batch commit failed (attempt {}), retrying in {:?}: {}",
                        id, attempt, delay, err
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    async fn fail(&self, id: i64, worker: &str, failure: &ImportFailure) -> Result<RunOutcome, StoreError> {
        match self.store.fail(id, worker, failure).await {
            Ok(job) => Ok(RunOutcome::Failed(job)),
            Err(e) if lost_claim(&e) => self.abandoned(id).await,
            Err(e) => Err(e),
        }
    }

    async fn abandoned(&self, id: i64) -> Result<RunOutcome, StoreError> {
        let job = self.store.get(id).await?;
        warn!("Import {}: left by another actor in status {}", id, job.status);
        Ok(RunOutcome::Abandoned(job))
    }
}

/// The job finished or another worker holds it now.
fn lost_claim(err: &StoreError) -> bool {
    matches!(err, StoreError::Inactive(_) | StoreError::AlreadyClaimed(_))
}

fn compile_config(documents: &ConfigDocuments) -> Result<ImportConfig, ImportFailure> {
    ImportConfig::from_documents(documents).map_err(|e| ImportFailure::from(&e))
}

fn build_batch(job: &ImportJob, validator: &mut RowValidator<'_>, rows: &[RawRow]) -> BatchResult {
    let mut batch = BatchResult::default();
    for row in rows {
        match validator.validate(row) {
            RowOutcome::Valid(record) => batch.jobs.push(NewJob::from_record(job.company_id, job.id, &record)),
            RowOutcome::Invalid(err) | RowOutcome::Duplicate(err) => batch.row_errors.push(err),
        }
    }
    batch
}

/// Exponential backoff with up to 50% jitter.
fn backoff(base: Duration, attempt: u32) -> Duration {
    let factor = 1u32 << attempt.saturating_sub(1).min(10);
    let delay = base.saturating_mul(factor);
    let jitter_ms = (delay.as_millis() as u64 / 2).max(1);
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
}
