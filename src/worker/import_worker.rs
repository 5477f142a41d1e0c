use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::import::executor::{BatchExecutor, RunOutcome, RunSignals};
use crate::import::model::ImportJob;
use crate::import::store::{ImportJobStore, StoreError};
use crate::worker::CancellationRegistry;

/// Candidates fetched per poll; claiming stops at the first success.
const CLAIM_CANDIDATES: i64 = 10;

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Heartbeat age after which another worker may take a job over.
    pub claim_lease: Duration,
    /// Sleep between polls when nothing is claimable.
    pub poll_interval: Duration,
}

/// Background worker that claims import jobs and runs them
pub struct ImportWorker {
    store: Arc<dyn ImportJobStore>,
    executor: Arc<BatchExecutor>,
    registry: Arc<CancellationRegistry>,
    settings: WorkerSettings,
}

impl ImportWorker {
    pub fn new(
        store: Arc<dyn ImportJobStore>,
        executor: Arc<BatchExecutor>,
        registry: Arc<CancellationRegistry>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            store,
            executor,
            registry,
            settings,
        }
    }

    /// Run worker with semaphore-based bounded concurrency
    ///
    /// # Concurrency Model
    /// - A semaphore permit is acquired before claiming, so a job is never
    ///   claimed without capacity to run it
    /// - Each claimed job runs on its own task; the permit is released when
    ///   the run ends
    /// - On shutdown the worker stops claiming, in-flight runs suspend at
    ///   their next batch boundary, and the worker waits for them
    pub async fn run(&self, worker_id: u32, semaphore: Arc<Semaphore>, shutdown: CancellationToken) {
        let name = format!("worker-{}-{}", std::process::id(), worker_id);
        info!("Worker {} ({}) started with semaphore-based concurrency", worker_id, name);

        let mut tasks = JoinSet::new();
        loop {
            while let Some(finished) = tasks.try_join_next() {
                if let Err(e) = finished {
                    error!("Worker {} import task panicked: {:?}", worker_id, e);
                }
            }

            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(e) => {
                        error!("Worker {} failed to acquire semaphore: {:?}", worker_id, e);
                        break;
                    }
                },
            };

            match self.claim_next(&name).await {
                Ok(Some(job)) => {
                    info!(
                        "Worker {} claimed import {} (company {}, status {})",
                        worker_id, job.id, job.company_id, job.status
                    );

                    let store = self.store.clone();
                    let executor = self.executor.clone();
                    let registry = self.registry.clone();
                    let signals = RunSignals {
                        cancel: registry.register(job.id),
                        shutdown: shutdown.clone(),
                    };
                    let worker = name.clone();

                    tasks.spawn(async move {
                        let id = job.id;
                        match executor.run(job, &worker, &signals).await {
                            Ok(outcome) => log_outcome(&outcome),
                            Err(e) => {
                                error!("Import {} stopped on a store error: {}", id, e);
                                // Leave it for another worker once the store is back.
                                if let Err(e) = store.release(id, &worker).await {
                                    warn!("Import {}: could not release claim: {}", id, e);
                                }
                            }
                        }
                        registry.remove(id);
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    debug!("Worker {} found no imports available, sleeping...", worker_id);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = sleep(self.settings.poll_interval) => {}
                    }
                }
                Err(e) => {
                    drop(permit);
                    error!("Worker {} encountered store error: {}", worker_id, e);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }

        info!("Worker {} waiting for {} running import(s)", worker_id, tasks.len());
        while let Some(finished) = tasks.join_next().await {
            if let Err(e) = finished {
                error!("Worker {} import task panicked: {:?}", worker_id, e);
            }
        }
        info!("Worker {} stopped", worker_id);
    }

    /// Claim the oldest claimable job, skipping ones another worker won.
    pub async fn claim_next(&self, worker: &str) -> Result<Option<ImportJob>, StoreError> {
        let candidates = self
            .store
            .list_claimable(self.settings.claim_lease, CLAIM_CANDIDATES)
            .await?;

        for id in candidates {
            match self.store.claim(id, worker, self.settings.claim_lease).await {
                Ok(job) => return Ok(Some(job)),
                Err(StoreError::AlreadyClaimed(_)) | Err(StoreError::Inactive(_)) | Err(StoreError::NotFound(_)) => {
                    debug!("Import {} was taken before {} could claim it", id, worker);
                }
                Err(StoreError::ImportInProgress(company_id)) => {
                    debug!("Import {} waits for another import of company {}", id, company_id);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }
}

fn log_outcome(outcome: &RunOutcome) {
    let job = outcome.job();
    match outcome {
        RunOutcome::Completed(_) => info!(
            "Completed import {}: {} created, {} failed, {} skipped",
            job.id, job.successful_imports, job.failed_imports, job.skipped_records
        ),
        RunOutcome::Failed(_) => warn!(
            "Import {} failed: {}",
            job.id,
            job.last_error.as_ref().map_or("unknown error", |e| e.message.as_str())
        ),
        RunOutcome::Cancelled(_) => info!("Import {} cancelled", job.id),
        RunOutcome::Suspended(_) => info!("Import {} suspended for shutdown", job.id),
        RunOutcome::Abandoned(_) => warn!("Import {} abandoned in status {}", job.id, job.status),
    }
}
