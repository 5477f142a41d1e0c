//! Periodic timeout sweep.
//!
//! Fails imports that stayed active longer than the configured maximum and
//! trips their cancellation tokens so a local run stops at its next batch.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::import::store::{ImportJobStore, StoreError};
use crate::worker::CancellationRegistry;

/// Run one sweep. Returns the ids that were failed.
pub async fn sweep_once(
    store: &dyn ImportJobStore,
    registry: &CancellationRegistry,
    max_duration: Duration,
) -> Result<Vec<i64>, StoreError> {
    let timed_out = store.fail_timed_out(max_duration).await?;
    for id in &timed_out {
        warn!("Import {} exceeded {}s and was failed", id, max_duration.as_secs());
        registry.cancel(*id);
    }
    Ok(timed_out)
}

/// Sweep every `interval` until `shutdown` is triggered.
pub async fn run(
    store: Arc<dyn ImportJobStore>,
    registry: Arc<CancellationRegistry>,
    max_duration: Duration,
    interval: Duration,
    shutdown: CancellationToken,
) {
    info!(
        "Timeout sweep started (max duration {}s, every {}s)",
        max_duration.as_secs(),
        interval.as_secs()
    );

    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Timeout sweep stopping");
                break;
            }
            _ = ticker.tick() => {
                match sweep_once(store.as_ref(), &registry, max_duration).await {
                    Ok(ids) if ids.is_empty() => debug!("Timeout sweep: nothing to fail"),
                    Ok(ids) => info!("Timeout sweep failed {} import(s)", ids.len()),
                    Err(e) => error!("Timeout sweep failed: {}", e),
                }
            }
        }
    }
}
