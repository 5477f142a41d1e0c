use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

/// Cancellation tokens of the imports running in this process, by job id.
///
/// The persisted `cancel_requested_at` flag reaches every worker eventually;
/// the token lets a local run stop at its very next batch boundary.
#[derive(Debug, Default)]
pub struct CancellationRegistry {
    running: Mutex<HashMap<i64, CancellationToken>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<i64, CancellationToken>> {
        self.running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Token for a run that is about to start.
    pub fn register(&self, import_job_id: i64) -> CancellationToken {
        self.lock().entry(import_job_id).or_default().clone()
    }

    /// Trigger the token of a running import. Returns false if it is not
    /// running here.
    pub fn cancel(&self, import_job_id: i64) -> bool {
        match self.lock().get(&import_job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, import_job_id: i64) {
        self.lock().remove(&import_job_id);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
