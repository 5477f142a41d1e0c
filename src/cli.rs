use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use sqlx::{Pool, Postgres};
use std::time::Duration;
use tracing::info;

use crate::api::import::dto::ImportJobResponse;
use crate::db::job_repository::JobRepository;
use crate::import::store::ImportJobStore;
use crate::worker::{sweeper, CancellationRegistry};

/// Bulk job-posting import service
#[derive(Debug, Parser)]
#[command(name = "job-import", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the HTTP API with the import workers (default)
    Serve,
    /// Apply pending database migrations and exit
    Migrate,
    /// Fail imports that exceeded the maximum duration, once
    Sweep,
    /// Print an import job as JSON
    Status {
        /// Import job id
        id: i64,
    },
}

#[derive(Serialize)]
struct StatusReport {
    #[serde(flatten)]
    job: ImportJobResponse,
    row_errors: usize,
    jobs_created: i64,
}

/// One timeout sweep outside the server.
pub async fn sweep(store: &dyn ImportJobStore, max_duration: Duration) -> anyhow::Result<()> {
    // Nothing runs in this process, so there are no local tokens to trip.
    let registry = CancellationRegistry::new();
    let failed = sweeper::sweep_once(store, &registry, max_duration)
        .await
        .context("timeout sweep failed")?;
    info!("Sweep failed {} import(s)", failed.len());
    println!("{}", serde_json::to_string(&failed)?);
    Ok(())
}

pub async fn status(store: &dyn ImportJobStore, pool: &Pool<Postgres>, id: i64) -> anyhow::Result<()> {
    let job = store
        .get(id)
        .await
        .with_context(|| format!("could not load import {}", id))?;
    let row_errors = store.row_errors(id).await?.len();
    let mut conn = pool.acquire().await?;
    let jobs_created = JobRepository::count_for_import(&mut *conn, id).await?;

    let report = StatusReport {
        job: ImportJobResponse::from(&job),
        row_errors,
        jobs_created,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
