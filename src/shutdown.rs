use actix_web::dev::ServerHandle;
use sqlx::{Pool, Postgres};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Handles graceful shutdown of the application
///
/// This module orchestrates graceful shutdown by:
/// 1. Listening for shutdown signals (SIGTERM, SIGINT/CTRL+C)
/// 2. Stopping the HTTP server (stops accepting new requests)
/// 3. Signaling workers and the sweep to stop; running imports suspend at
///    their next batch boundary and release their claim
/// 4. Waiting for the background tasks to finish
/// 5. Closing database connections
pub struct ShutdownCoordinator {
    server_handle: ServerHandle,
    server_task: JoinHandle<Result<(), std::io::Error>>,
    background_handles: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
    pool: Pool<Postgres>,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator
    pub fn new(
        server_handle: ServerHandle,
        server_task: JoinHandle<Result<(), std::io::Error>>,
        background_handles: Vec<JoinHandle<()>>,
        shutdown: CancellationToken,
        pool: Pool<Postgres>,
    ) -> Self {
        Self {
            server_handle,
            server_task,
            background_handles,
            shutdown,
            pool,
        }
    }

    /// Wait for CTRL+C or SIGTERM (Unix only), then shut down gracefully
    pub async fn wait_for_shutdown(self) -> Result<(), std::io::Error> {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for CTRL+C: {:?}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    error!("Failed to install SIGTERM signal handler: {:?}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received CTRL+C signal, initiating graceful shutdown...");
            }
            _ = terminate => {
                info!("Received SIGTERM signal, initiating graceful shutdown...");
            }
        }

        self.shutdown().await
    }

    /// Perform the actual shutdown sequence
    async fn shutdown(self) -> Result<(), std::io::Error> {
        // 1. Stop HTTP server (stop accepting new requests)
        info!("Stopping HTTP server (no longer accepting new requests)...");
        self.server_handle.stop(true).await;
        info!("HTTP server stopped accepting new requests");

        // 2. Signal workers and the sweep
        info!("Signaling workers to stop claiming imports...");
        self.shutdown.cancel();

        // 3. Wait for background tasks; imports suspend at a batch boundary
        let total = self.background_handles.len();
        info!("Waiting for {} background tasks to stop...", total);
        let mut stopped = 0;
        for (i, handle) in self.background_handles.into_iter().enumerate() {
            match handle.await {
                Ok(_) => {
                    stopped += 1;
                    info!("Background task {} stopped ({}/{})", i + 1, stopped, total);
                }
                Err(e) => error!("Background task {} failed to stop: {:?}", i + 1, e),
            }
        }
        info!("All background tasks stopped");

        // 4. Wait for HTTP server task to complete
        info!("Waiting for HTTP server to fully shut down...");
        match self.server_task.await {
            Ok(Ok(_)) => info!("HTTP server shut down successfully"),
            Ok(Err(e)) => error!("HTTP server encountered error during shutdown: {:?}", e),
            Err(e) => error!("HTTP server task panicked: {:?}", e),
        }

        // 5. Close database connections
        info!("Closing database connection pool...");
        self.pool.close().await;
        info!("Database connections closed");

        info!("Graceful shutdown completed successfully");
        Ok(())
    }
}
