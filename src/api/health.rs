use actix_web::{HttpResponse, Responder, get, web};
use serde::Serialize;
use sqlx::{Pool, Postgres};
use tracing::error;

use crate::worker::CancellationRegistry;

/// Health check response
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    database: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    running_imports: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

async fn ping(pool: &Pool<Postgres>) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").fetch_one(pool).await.map(|_| ())
}

/// Health check endpoint
///
/// Database connectivity plus the number of imports running in this process.
#[get("/health")]
async fn health_check(
    pool: web::Data<Pool<Postgres>>,
    registry: web::Data<CancellationRegistry>,
) -> impl Responder {
    match ping(pool.get_ref()).await {
        Ok(()) => HttpResponse::Ok().json(HealthResponse {
            status: "healthy",
            database: "connected",
            running_imports: Some(registry.len()),
            error: None,
        }),
        Err(e) => {
            error!("Health check failed: {:?}", e);
            HttpResponse::ServiceUnavailable().json(HealthResponse {
                status: "unhealthy",
                database: "disconnected",
                running_imports: Some(registry.len()),
                error: Some(format!("Database error: {}", e)),
            })
        }
    }
}

/// Readiness check endpoint
///
/// Returns 503 while the database is unavailable so the instance is taken
/// out of rotation; it recovers on its own when the database returns.
#[get("/ready")]
async fn readiness_check(pool: web::Data<Pool<Postgres>>) -> impl Responder {
    match ping(pool.get_ref()).await {
        Ok(()) => HttpResponse::Ok().json(HealthResponse {
            status: "ready",
            database: "connected",
            running_imports: None,
            error: None,
        }),
        Err(e) => {
            error!("Readiness check failed: database unavailable: {:?}", e);
            HttpResponse::ServiceUnavailable().json(HealthResponse {
                status: "not_ready",
                database: "disconnected",
                running_imports: None,
                error: Some(format!("Database unavailable: {}", e)),
            })
        }
    }
}

/// Liveness check endpoint
///
/// Simple check that the process is alive. Does not check dependencies.
#[get("/live")]
async fn liveness_check() -> impl Responder {
    HttpResponse::Ok().json(HealthResponse {
        status: "alive",
        database: "not_checked",
        running_imports: None,
        error: None,
    })
}

pub fn health_config(config: &mut web::ServiceConfig) {
    config
        .service(health_check)
        .service(readiness_check)
        .service(liveness_check);
}
