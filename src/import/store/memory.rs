use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use super::{ensure_held, ImportJobStore, StoreError};
use crate::import::error::{ImportFailure, PersistenceError, RowError};
use crate::import::model::{progress_for, BatchResult, ImportJob, ImportStatus, NewImportJob, NewJob};

#[derive(Default)]
struct State {
    next_id: i64,
    jobs: BTreeMap<i64, ImportJob>,
    created: Vec<NewJob>,
    row_errors: BTreeMap<i64, Vec<RowError>>,
    progress: BTreeMap<i64, Vec<i16>>,
    failing_commits: usize,
    cancel_after: BTreeMap<i64, usize>,
}

impl State {
    fn job_mut(&mut self, id: i64) -> Result<&mut ImportJob, StoreError> {
        self.jobs.get_mut(&id).ok_or(StoreError::NotFound(id))
    }

    fn held_job_mut(&mut self, id: i64, worker: &str) -> Result<&mut ImportJob, StoreError> {
        let job = self.job_mut(id)?;
        ensure_held(job, worker)?;
        Ok(job)
    }

    /// A pending job runs only after its company's active job and every older
    /// pending job of the same company.
    fn waits_for_company(&self, job: &ImportJob) -> bool {
        self.jobs.values().any(|other| {
            other.company_id == job.company_id
                && other.id != job.id
                && (other.status.is_active() || (other.status == ImportStatus::Pending && other.id < job.id))
        })
    }

    fn claimable(&self, job: &ImportJob, lease: Duration, now: DateTime<Utc>) -> bool {
        match job.status {
            ImportStatus::Pending => job.claimed_by.is_none() && !self.waits_for_company(job),
            status if status.is_active() => lease_expired(job, lease, now),
            _ => false,
        }
    }
}

fn lease_expired(job: &ImportJob, lease: Duration, now: DateTime<Utc>) -> bool {
    match (&job.claimed_by, job.heartbeat_at) {
        (None, _) | (_, None) => true,
        (Some(_), Some(beat)) => chrono::Duration::from_std(lease)
            .ok()
            .and_then(|lease| beat.checked_add_signed(lease))
            .map_or(false, |deadline| deadline < now),
    }
}

/// In-process [`ImportJobStore`] with hooks for exercising failure paths.
#[derive(Default)]
pub struct MemoryImportJobStore {
    state: Mutex<State>,
}

impl MemoryImportJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Jobs committed for an import, in commit order.
    pub fn created_jobs(&self, import_job_id: i64) -> Vec<NewJob> {
        self.lock()
            .created
            .iter()
            .filter(|job| job.import_job_id == Some(import_job_id))
            .cloned()
            .collect()
    }

    /// Every progress value written for an import, in order.
    pub fn progress_history(&self, import_job_id: i64) -> Vec<i16> {
        self.lock().progress.get(&import_job_id).cloned().unwrap_or_default()
    }

    /// Make the next `count` batch commits fail with a persistence error.
    pub fn fail_next_commits(&self, count: usize) {
        self.lock().failing_commits = count;
    }

    /// Record a cancellation request right after the `batches`-th commit.
    pub fn cancel_after_batches(&self, import_job_id: i64, batches: usize) {
        self.lock().cancel_after.insert(import_job_id, batches);
    }

    /// Pretend the current holder stopped heartbeating.
    pub fn expire_claim(&self, import_job_id: i64) {
        if let Some(job) = self.lock().jobs.get_mut(&import_job_id) {
            job.heartbeat_at = None;
        }
    }

    /// Move `started_at` back in time.
    pub fn backdate_start(&self, import_job_id: i64, by: Duration) {
        if let Some(job) = self.lock().jobs.get_mut(&import_job_id) {
            let by = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero());
            job.started_at = job.started_at.map(|at| at - by);
        }
    }
}

#[async_trait]
impl ImportJobStore for MemoryImportJobStore {
    async fn create(&self, new_job: NewImportJob) -> Result<ImportJob, StoreError> {
        let mut state = self.lock();
        let busy = state
            .jobs
            .values()
            .any(|job| job.company_id == new_job.company_id && job.status.is_active());
        if busy {
            return Err(StoreError::ImportInProgress(new_job.company_id));
        }

        state.next_id += 1;
        let now = Utc::now();
        let job = ImportJob {
            id: state.next_id,
            company_id: new_job.company_id,
            created_by: new_job.created_by,
            file_url: new_job.file_url,
            file_size: new_job.file_size,
            file_name: new_job.file_name,
            documents: new_job.documents,
            status: ImportStatus::Pending,
            progress: 0,
            total_records: 0,
            successful_imports: 0,
            failed_imports: 0,
            skipped_records: 0,
            last_error: None,
            claimed_by: None,
            heartbeat_at: None,
            cancel_requested_at: None,
            started_at: None,
            completed_at: None,
            cancelled_at: None,
            created_at: now,
            updated_at: now,
        };
        state.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get(&self, id: i64) -> Result<ImportJob, StoreError> {
        self.lock().jobs.get(&id).cloned().ok_or(StoreError::NotFound(id))
    }

    async fn list_for_company(&self, company_id: i64, limit: i64) -> Result<Vec<ImportJob>, StoreError> {
        Ok(self
            .lock()
            .jobs
            .values()
            .rev()
            .filter(|job| job.company_id == company_id)
            .take(usize::try_from(limit).unwrap_or(0))
            .cloned()
            .collect())
    }

    async fn list_claimable(&self, lease: Duration, limit: i64) -> Result<Vec<i64>, StoreError> {
        let now = Utc::now();
        let state = self.lock();
        Ok(state
            .jobs
            .values()
            .filter(|job| state.claimable(job, lease, now))
            .take(usize::try_from(limit).unwrap_or(0))
            .map(|job| job.id)
            .collect())
    }

    async fn claim(&self, id: i64, worker: &str, lease: Duration) -> Result<ImportJob, StoreError> {
        let mut state = self.lock();
        let current = state.jobs.get(&id).ok_or(StoreError::NotFound(id))?;
        if current.status.is_terminal() {
            return Err(StoreError::Inactive(id));
        }
        let now = Utc::now();
        if !state.claimable(current, lease, now) {
            return Err(match current.status {
                ImportStatus::Pending if current.claimed_by.is_none() => {
                    StoreError::ImportInProgress(current.company_id)
                }
                _ => StoreError::AlreadyClaimed(id),
            });
        }
        let job = state.job_mut(id)?;
        if job.status == ImportStatus::Pending {
            job.status = ImportStatus::Validating;
            job.started_at = Some(now);
        }
        job.claimed_by = Some(worker.to_string());
        job.heartbeat_at = Some(now);
        job.updated_at = now;
        Ok(job.clone())
    }

    async fn release(&self, id: i64, worker: &str) -> Result<(), StoreError> {
        let mut state = self.lock();
        let job = state.job_mut(id)?;
        if job.claimed_by.as_deref() == Some(worker) {
            job.claimed_by = None;
            job.heartbeat_at = None;
        }
        Ok(())
    }

    async fn set_total_records(&self, id: i64, worker: &str, total: i64) -> Result<ImportJob, StoreError> {
        let mut state = self.lock();
        let job = state.held_job_mut(id, worker)?;
        job.total_records = total;
        job.heartbeat_at = Some(Utc::now());
        Ok(job.clone())
    }

    async fn mark_processing(&self, id: i64, worker: &str) -> Result<ImportJob, StoreError> {
        let mut state = self.lock();
        let job = state.held_job_mut(id, worker)?;
        job.status = ImportStatus::Processing;
        job.heartbeat_at = Some(Utc::now());
        Ok(job.clone())
    }

    async fn apply_batch_result(
        &self,
        id: i64,
        worker: &str,
        offset: i64,
        batch: &BatchResult,
    ) -> Result<ImportJob, StoreError> {
        let mut state = self.lock();
        if state.failing_commits > 0 {
            state.failing_commits -= 1;
            return Err(PersistenceError("simulated commit failure".to_string()).into());
        }

        let delta = batch.delta();
        let now = Utc::now();
        let job = state.held_job_mut(id, worker)?;
        if job.processed_rows() != offset {
            return Err(StoreError::AlreadyClaimed(id));
        }
        job.successful_imports += delta.successful;
        job.failed_imports += delta.failed;
        job.skipped_records += delta.skipped;
        job.progress = job
            .progress
            .max(progress_for(job.processed_rows(), job.total_records));
        if let Some(failure) = &batch.last_error {
            job.last_error = Some(failure.clone());
        }
        job.heartbeat_at = Some(now);
        job.updated_at = now;
        let snapshot = job.clone();

        state.created.extend(batch.jobs.iter().cloned());
        state
            .row_errors
            .entry(id)
            .or_default()
            .extend(batch.row_errors.iter().cloned());
        state.progress.entry(id).or_default().push(snapshot.progress);

        let mut snapshot = snapshot;
        if let Some(remaining) = state.cancel_after.get_mut(&id) {
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                state.cancel_after.remove(&id);
                let job = state.job_mut(id)?;
                job.cancel_requested_at = Some(now);
                snapshot = job.clone();
            }
        }
        Ok(snapshot)
    }

    async fn request_cancel(&self, id: i64) -> Result<ImportJob, StoreError> {
        let mut state = self.lock();
        let job = state.job_mut(id)?;
        if job.status.is_active() && job.cancel_requested_at.is_none() {
            job.cancel_requested_at = Some(Utc::now());
        }
        Ok(job.clone())
    }

    async fn complete(&self, id: i64, worker: &str) -> Result<ImportJob, StoreError> {
        let mut state = self.lock();
        let now = Utc::now();
        let job = state.held_job_mut(id, worker)?;
        job.status = ImportStatus::Completed;
        job.progress = 100;
        job.completed_at = Some(now);
        job.claimed_by = None;
        job.updated_at = now;
        let snapshot = job.clone();
        state.progress.entry(id).or_default().push(100);
        Ok(snapshot)
    }

    async fn fail(&self, id: i64, worker: &str, failure: &ImportFailure) -> Result<ImportJob, StoreError> {
        let mut state = self.lock();
        let now = Utc::now();
        let job = state.held_job_mut(id, worker)?;
        job.status = ImportStatus::Failed;
        job.last_error = Some(failure.clone());
        job.completed_at = Some(now);
        job.claimed_by = None;
        job.updated_at = now;
        Ok(job.clone())
    }

    async fn cancel(&self, id: i64, worker: &str) -> Result<ImportJob, StoreError> {
        let mut state = self.lock();
        let now = Utc::now();
        let job = state.held_job_mut(id, worker)?;
        job.status = ImportStatus::Cancelled;
        job.cancelled_at = Some(now);
        job.claimed_by = None;
        job.updated_at = now;
        Ok(job.clone())
    }

    async fn fail_timed_out(&self, max_duration: Duration) -> Result<Vec<i64>, StoreError> {
        let max_duration_secs = max_duration.as_secs();
        let cutoff = chrono::Duration::from_std(max_duration)
            .ok()
            .and_then(|max| Utc::now().checked_sub_signed(max));
        let mut state = self.lock();
        let mut timed_out = Vec::new();
        for job in state.jobs.values_mut() {
            let expired = match (job.started_at, cutoff) {
                (Some(started), Some(cutoff)) => started < cutoff,
                _ => false,
            };
            if job.status.is_active() && expired {
                job.status = ImportStatus::Failed;
                job.last_error = Some(ImportFailure::timeout(max_duration_secs));
                job.completed_at = Some(Utc::now());
                job.claimed_by = None;
                timed_out.push(job.id);
            }
        }
        Ok(timed_out)
    }

    async fn row_errors(&self, id: i64) -> Result<Vec<RowError>, StoreError> {
        let state = self.lock();
        if !state.jobs.contains_key(&id) {
            return Err(StoreError::NotFound(id));
        }
        let mut errors = state.row_errors.get(&id).cloned().unwrap_or_default();
        errors.sort_by_key(|e| e.row_index);
        Ok(errors)
    }
}
