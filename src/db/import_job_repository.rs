//! PostgreSQL-backed [`ImportJobStore`].
//!
//! State transitions are single conditional `UPDATE ... RETURNING` statements
//! guarded on status and on the claim holder, so concurrent workers and the
//! timeout sweep serialize on the row lock. A batch commit locks the job row
//! `FOR UPDATE`, checks holder and row offset, and writes the postings, row
//! errors and counters in one transaction. A partial unique index keeps a
//! company at one active import even when two claims race.

use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::postgres::PgArguments;
use sqlx::query::QueryAs;
use sqlx::{Pool, Postgres, QueryBuilder};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::db::job_repository::JobRepository;
use crate::db::models::{ImportJobRow, RowErrorRow};
use crate::import::error::{ImportFailure, PersistenceError, RowError};
use crate::import::model::{progress_for, BatchResult, ImportJob, ImportStatus, NewImportJob};
use crate::import::store::{ensure_held, ImportJobStore, StoreError};

/// Column list for `import_jobs` queries.
const COLUMNS: &str = "\
    id, company_id, created_by, file_url, file_size, file_name, \
    mapping_config, validation_rules, default_values, options, \
    status, progress, total_records, successful_imports, failed_imports, skipped_records, \
    last_error, claimed_by, heartbeat_at, cancel_requested_at, \
    started_at, completed_at, cancelled_at, created_at, updated_at";

const ACTIVE: &str = "status IN ('validating', 'processing')";

/// Pending and unclaimed with no active or older pending import of the same
/// company, or active with a stale heartbeat. Binds the lease in seconds as
/// `$LEASE`.
const CLAIMABLE: &str = "((status = 'pending' AND claimed_by IS NULL \
         AND NOT EXISTS ( \
             SELECT 1 FROM import_jobs o \
             WHERE o.company_id = import_jobs.company_id AND o.id <> import_jobs.id \
               AND (o.status IN ('validating', 'processing') \
                    OR (o.status = 'pending' AND o.id < import_jobs.id)))) \
     OR (status IN ('validating', 'processing') \
         AND (claimed_by IS NULL OR heartbeat_at IS NULL \
              OR heartbeat_at < NOW() - make_interval(secs => $LEASE))))";

/// SQLSTATE for `unique_violation`.
const UNIQUE_VIOLATION: &str = "23505";

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Persistence(PersistenceError(err.to_string()))
    }
}

fn into_job(row: ImportJobRow) -> Result<ImportJob, StoreError> {
    Ok(ImportJob::try_from(row)?)
}

fn claimable_clause(param: usize) -> String {
    CLAIMABLE.replace("$LEASE", &format!("${}", param))
}

/// The one-active-import-per-company index rejected the write.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|e| e.code())
        .map_or(false, |code| code == UNIQUE_VIOLATION)
}

#[derive(Clone)]
pub struct PgImportJobStore {
    pool: Pool<Postgres>,
}

impl PgImportJobStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Run an `UPDATE ... WHERE id = $1 AND claimed_by = $2 AND <active>` that
    /// returns the job. When nothing matched, tells a missing job, a finished
    /// one and one held by another worker apart.
    async fn update_held(
        &self,
        id: i64,
        worker: &str,
        query: QueryAs<'_, Postgres, ImportJobRow, PgArguments>,
    ) -> Result<ImportJob, StoreError> {
        match query.fetch_optional(&self.pool).await? {
            Some(row) => into_job(row),
            None => {
                let current = self.get(id).await?;
                ensure_held(&current, worker)?;
                Err(StoreError::AlreadyClaimed(id))
            }
        }
    }
}

#[async_trait]
impl ImportJobStore for PgImportJobStore {
    async fn create(&self, new_job: NewImportJob) -> Result<ImportJob, StoreError> {
        let query = format!(
            "INSERT INTO import_jobs \
                 (company_id, created_by, file_url, file_size, file_name, \
                  mapping_config, validation_rules, default_values, options) \
             SELECT $1, $2, $3, $4, $5, $6, $7, $8, $9 \
             WHERE NOT EXISTS ( \
                 SELECT 1 FROM import_jobs WHERE company_id = $1 AND {ACTIVE} \
             ) \
             RETURNING {COLUMNS}"
        );
        let row = sqlx::query_as::<_, ImportJobRow>(&query)
            .bind(new_job.company_id)
            .bind(new_job.created_by)
            .bind(&new_job.file_url)
            .bind(new_job.file_size)
            .bind(&new_job.file_name)
            .bind(&new_job.documents.mapping_config)
            .bind(&new_job.documents.validation_rules)
            .bind(&new_job.documents.default_values)
            .bind(&new_job.documents.options)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let job = into_job(row)?;
                debug!("Import job created with id={}", job.id);
                Ok(job)
            }
            None => Err(StoreError::ImportInProgress(new_job.company_id)),
        }
    }

    async fn get(&self, id: i64) -> Result<ImportJob, StoreError> {
        let query = format!("SELECT {COLUMNS} FROM import_jobs WHERE id = $1");
        sqlx::query_as::<_, ImportJobRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound(id))
            .and_then(into_job)
    }

    async fn list_for_company(&self, company_id: i64, limit: i64) -> Result<Vec<ImportJob>, StoreError> {
        let query = format!(
            "SELECT {COLUMNS} FROM import_jobs WHERE company_id = $1 ORDER BY id DESC LIMIT $2"
        );
        sqlx::query_as::<_, ImportJobRow>(&query)
            .bind(company_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(into_job)
            .collect()
    }

    async fn list_claimable(&self, lease: Duration, limit: i64) -> Result<Vec<i64>, StoreError> {
        let query = format!(
            "SELECT id FROM import_jobs WHERE {} ORDER BY created_at, id LIMIT $2",
            claimable_clause(1)
        );
        Ok(sqlx::query_scalar::<_, i64>(&query)
            .bind(lease.as_secs_f64())
            .bind(limit)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn claim(&self, id: i64, worker: &str, lease: Duration) -> Result<ImportJob, StoreError> {
        let query = format!(
            "UPDATE import_jobs \
             SET status = CASE WHEN status = 'pending' THEN 'validating' ELSE status END, \
                 started_at = COALESCE(started_at, NOW()), \
                 claimed_by = $2, heartbeat_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND {} \
             RETURNING {COLUMNS}",
            claimable_clause(3)
        );
        let row = match sqlx::query_as::<_, ImportJobRow>(&query)
            .bind(id)
            .bind(worker)
            .bind(lease.as_secs_f64())
            .fetch_optional(&self.pool)
            .await
        {
            Ok(row) => row,
            Err(err) if is_unique_violation(&err) => {
                let current = self.get(id).await?;
                debug!("Import {}: claim lost a race for company {}", id, current.company_id);
                return Err(StoreError::ImportInProgress(current.company_id));
            }
            Err(err) => return Err(err.into()),
        };

        match row {
            Some(row) => into_job(row),
            None => {
                let current = self.get(id).await?;
                match current.status {
                    status if status.is_terminal() => Err(StoreError::Inactive(id)),
                    ImportStatus::Pending if current.claimed_by.is_none() => {
                        Err(StoreError::ImportInProgress(current.company_id))
                    }
                    _ => Err(StoreError::AlreadyClaimed(id)),
                }
            }
        }
    }

    async fn release(&self, id: i64, worker: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE import_jobs SET claimed_by = NULL, heartbeat_at = NULL, updated_at = NOW() \
             WHERE id = $1 AND claimed_by = $2",
        )
        .bind(id)
        .bind(worker)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_total_records(&self, id: i64, worker: &str, total: i64) -> Result<ImportJob, StoreError> {
        let query = format!(
            "UPDATE import_jobs SET total_records = $3, heartbeat_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND claimed_by = $2 AND {ACTIVE} RETURNING {COLUMNS}"
        );
        self.update_held(
            id,
            worker,
            sqlx::query_as::<_, ImportJobRow>(&query).bind(id).bind(worker).bind(total),
        )
        .await
    }

    async fn mark_processing(&self, id: i64, worker: &str) -> Result<ImportJob, StoreError> {
        let query = format!(
            "UPDATE import_jobs SET status = 'processing', heartbeat_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND claimed_by = $2 AND {ACTIVE} RETURNING {COLUMNS}"
        );
        self.update_held(id, worker, sqlx::query_as::<_, ImportJobRow>(&query).bind(id).bind(worker))
            .await
    }

    async fn apply_batch_result(
        &self,
        id: i64,
        worker: &str,
        offset: i64,
        batch: &BatchResult,
    ) -> Result<ImportJob, StoreError> {
        let mut tx = self.pool.begin().await?;

        let lock = format!("SELECT {COLUMNS} FROM import_jobs WHERE id = $1 FOR UPDATE");
        let current = match sqlx::query_as::<_, ImportJobRow>(&lock)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
        {
            Some(row) => into_job(row)?,
            None => {
                tx.rollback().await?;
                return Err(StoreError::NotFound(id));
            }
        };
        let fenced = ensure_held(&current, worker).and_then(|()| {
            if current.processed_rows() == offset {
                Ok(())
            } else {
                Err(StoreError::AlreadyClaimed(id))
            }
        });
        if let Err(err) = fenced {
            tx.rollback().await?;
            warn!(
                "Import {}: rejected batch from {} at row {} (holder={:?}, processed={})",
                id,
                worker,
                offset,
                current.claimed_by,
                current.processed_rows()
            );
            return Err(err);
        }

        JobRepository::bulk_create(&mut *tx, &batch.jobs).await?;

        if !batch.row_errors.is_empty() {
            let mut insert = QueryBuilder::<Postgres>::new(
                "INSERT INTO import_row_errors (import_job_id, row_index, kind, errors) ",
            );
            insert.push_values(&batch.row_errors, |mut row, err| {
                row.push_bind(id)
                    .push_bind(err.row_index as i64)
                    .push_bind(err.kind.as_str())
                    .push_bind(Json(err.errors.clone()));
            });
            insert.build().execute(&mut *tx).await?;
        }

        let delta = batch.delta();
        let processed = current.processed_rows() + delta.rows();
        let progress = current.progress.max(progress_for(processed, current.total_records));
        let update = format!(
            "UPDATE import_jobs \
             SET successful_imports = successful_imports + $2, \
                 failed_imports = failed_imports + $3, \
                 skipped_records = skipped_records + $4, \
                 progress = $5, \
                 last_error = COALESCE($6, last_error), \
                 heartbeat_at = NOW(), updated_at = NOW() \
             WHERE id = $1 RETURNING {COLUMNS}"
        );
        let row = sqlx::query_as::<_, ImportJobRow>(&update)
            .bind(id)
            .bind(delta.successful)
            .bind(delta.failed)
            .bind(delta.skipped)
            .bind(progress)
            .bind(batch.last_error.clone().map(Json))
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        debug!(
            "Import {}: batch applied (+{} ok, +{} failed, +{} skipped)",
            id, delta.successful, delta.failed, delta.skipped
        );
        into_job(row)
    }

    async fn request_cancel(&self, id: i64) -> Result<ImportJob, StoreError> {
        let query = format!(
            "UPDATE import_jobs SET cancel_requested_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND {ACTIVE} AND cancel_requested_at IS NULL RETURNING {COLUMNS}"
        );
        match sqlx::query_as::<_, ImportJobRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
        {
            Some(row) => into_job(row),
            None => self.get(id).await,
        }
    }

    async fn complete(&self, id: i64, worker: &str) -> Result<ImportJob, StoreError> {
        let query = format!(
            "UPDATE import_jobs \
             SET status = 'completed', progress = 100, completed_at = NOW(), \
                 claimed_by = NULL, heartbeat_at = NULL, updated_at = NOW() \
             WHERE id = $1 AND claimed_by = $2 AND {ACTIVE} RETURNING {COLUMNS}"
        );
        self.update_held(id, worker, sqlx::query_as::<_, ImportJobRow>(&query).bind(id).bind(worker))
            .await
    }

    async fn fail(&self, id: i64, worker: &str, failure: &ImportFailure) -> Result<ImportJob, StoreError> {
        let query = format!(
            "UPDATE import_jobs \
             SET status = 'failed', last_error = $3, completed_at = NOW(), \
                 claimed_by = NULL, heartbeat_at = NULL, updated_at = NOW() \
             WHERE id = $1 AND claimed_by = $2 AND {ACTIVE} RETURNING {COLUMNS}"
        );
        self.update_held(
            id,
            worker,
            sqlx::query_as::<_, ImportJobRow>(&query)
                .bind(id)
                .bind(worker)
                .bind(Json(failure.clone())),
        )
        .await
    }

    async fn cancel(&self, id: i64, worker: &str) -> Result<ImportJob, StoreError> {
        let query = format!(
            "UPDATE import_jobs \
             SET status = 'cancelled', cancelled_at = NOW(), \
                 claimed_by = NULL, heartbeat_at = NULL, updated_at = NOW() \
             WHERE id = $1 AND claimed_by = $2 AND {ACTIVE} RETURNING {COLUMNS}"
        );
        self.update_held(id, worker, sqlx::query_as::<_, ImportJobRow>(&query).bind(id).bind(worker))
            .await
    }

    async fn fail_timed_out(&self, max_duration: Duration) -> Result<Vec<i64>, StoreError> {
        let failure = ImportFailure::timeout(max_duration.as_secs());
        let query = format!(
            "UPDATE import_jobs \
             SET status = 'failed', last_error = $2, completed_at = NOW(), \
                 claimed_by = NULL, heartbeat_at = NULL, updated_at = NOW() \
             WHERE {ACTIVE} AND started_at < NOW() - make_interval(secs => $1) \
             RETURNING id"
        );
        let ids = sqlx::query_scalar::<_, i64>(&query)
            .bind(max_duration.as_secs_f64())
            .bind(Json(failure))
            .fetch_all(&self.pool)
            .await?;
        if !ids.is_empty() {
            info!("Timed out {} import job(s): {:?}", ids.len(), ids);
        }
        Ok(ids)
    }

    async fn row_errors(&self, id: i64) -> Result<Vec<RowError>, StoreError> {
        self.get(id).await?;
        sqlx::query_as::<_, RowErrorRow>(
            "SELECT row_index, kind, errors FROM import_row_errors \
             WHERE import_job_id = $1 ORDER BY row_index",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|row| RowError::try_from(row).map_err(StoreError::from))
        .collect()
    }
}
