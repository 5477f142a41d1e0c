use actix_multipart::form::MultipartFormConfig;
use actix_web::{App, HttpServer, web};
use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::info;

use job_import::api::{health::health_config, import::{import_config, ImportService}, validation};
use job_import::cli::{self, Cli, Command};
use job_import::config::Config;
use job_import::db::{self, PgImportJobStore};
use job_import::import::executor::BatchExecutor;
use job_import::import::source::LocalFileStore;
use job_import::import::store::ImportJobStore;
use job_import::logging;
use job_import::shutdown::ShutdownCoordinator;
use job_import::worker::{sweeper, CancellationRegistry, ImportWorker, WorkerSettings};

/// Headroom for multipart boundaries and the text fields next to the file.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration from environment
    let config = Config::from_env()
        .map_err(anyhow::Error::msg)
        .context("Failed to load configuration")?;

    logging::init(&config.log_dir).context("Failed to create logs directory")?;

    let pool = db::connection::get_connection(&config.database_url, config.max_db_connections)
        .await
        .context("Failed to connect to database")?;
    info!("Database connection pool established");

    let store: Arc<dyn ImportJobStore> = Arc::new(PgImportJobStore::new(pool.clone()));

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config, pool, store).await,
        Command::Migrate => {
            db::migrations::run_migrations(&pool)
                .await
                .context("Failed to run database migrations")?;
            Ok(())
        }
        Command::Sweep => cli::sweep(store.as_ref(), config.max_job_duration).await,
        Command::Status { id } => cli::status(store.as_ref(), &pool, id).await,
    }
}

async fn serve(config: Config, pool: sqlx::PgPool, store: Arc<dyn ImportJobStore>) -> anyhow::Result<()> {
    info!("Starting job-import application");
    info!("Configuration loaded successfully:");
    info!("  - Max payload size: {} bytes", config.max_payload_size);
    info!("  - Max file size: {} bytes", config.max_file_size);
    info!("  - Max database connections: {}", config.max_db_connections);
    info!("  - Max concurrent imports: {}", config.max_concurrent_jobs);
    info!("  - Number of workers: {}", config.num_workers);
    info!("  - Default batch size: {}", config.default_batch_size);

    // Run migrations on startup (auto-migrate when starting server)
    db::migrations::run_migrations(&pool)
        .await
        .context("Failed to run database migrations")?;

    tokio::fs::create_dir_all(&config.upload_dir)
        .await
        .with_context(|| format!("Failed to create upload directory {}", config.upload_dir))?;
    let files = LocalFileStore::new(config.upload_dir.clone());

    let registry = Arc::new(CancellationRegistry::new());
    let executor = Arc::new(BatchExecutor::new(
        store.clone(),
        Arc::new(files.clone()),
        config.executor_settings(),
    ));
    let shutdown = CancellationToken::new();

    // Spawn background workers with semaphore-based bounded concurrency
    let semaphore = Arc::new(Semaphore::new(config.max_concurrent_jobs));
    let settings = WorkerSettings {
        claim_lease: config.claim_lease,
        poll_interval: config.poll_interval,
    };
    let mut background_handles = Vec::new();

    for worker_id in 1..=config.num_workers {
        let worker = ImportWorker::new(store.clone(), executor.clone(), registry.clone(), settings.clone());
        let worker_semaphore = semaphore.clone();
        let worker_shutdown = shutdown.clone();

        background_handles.push(tokio::spawn(async move {
            worker.run(worker_id, worker_semaphore, worker_shutdown).await;
        }));
        info!("Spawned worker {}", worker_id);
    }

    background_handles.push(tokio::spawn(sweeper::run(
        store.clone(),
        registry.clone(),
        config.max_job_duration,
        config.sweep_interval,
        shutdown.clone(),
    )));

    let import_service = web::Data::new(ImportService::new(
        store,
        files,
        registry.clone(),
        config.max_file_size as u64,
    ));
    let registry_data = web::Data::from(registry);
    let server_pool = pool.clone();
    let max_payload_size = config.max_payload_size;
    let max_upload_size = config.max_file_size + MULTIPART_OVERHEAD;

    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(server_pool.clone()))
            .app_data(import_service.clone())
            .app_data(registry_data.clone())
            .app_data(web::PayloadConfig::default().limit(max_payload_size))
            .app_data(MultipartFormConfig::default().total_limit(max_upload_size))
            .app_data(validation::json_config().limit(max_payload_size))
            .app_data(validation::path_config())
            .app_data(validation::query_config())
            .configure(health_config)
            .configure(import_config)
    });

    info!("Server starting on http://{}:{}", config.bind_addr, config.port);

    let server = server
        .bind((config.bind_addr.as_str(), config.port))
        .with_context(|| format!("Failed to bind {}:{}", config.bind_addr, config.port))?
        .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    let coordinator = ShutdownCoordinator::new(server_handle, server_task, background_handles, shutdown, pool);
    coordinator.wait_for_shutdown().await?;
    Ok(())
}
