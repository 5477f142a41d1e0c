use sqlx::{PgConnection, Postgres, QueryBuilder};
use tracing::debug;

use crate::import::model::NewJob;

/// Status every imported posting starts in.
const IMPORTED_JOB_STATUS: &str = "draft";

/// Repository for Job database operations
pub struct JobRepository;

impl JobRepository {
    /// Bulk insert job postings on an open connection or transaction.
    /// Returns the number of rows inserted.
    pub async fn bulk_create(conn: &mut PgConnection, jobs: &[NewJob]) -> Result<u64, sqlx::Error> {
        if jobs.is_empty() {
            debug!("Bulk create called with empty job list");
            return Ok(0);
        }

        debug!("Starting bulk insert of {} jobs", jobs.len());

        let mut query = QueryBuilder::<Postgres>::new(
            "INSERT INTO jobs (company_id, import_job_id, import_row_index, title, description, \
             location, department, employment_type, experience_level, remote, salary_min, \
             salary_max, salary_currency, application_deadline, contact_email, external_id, status) ",
        );
        query.push_values(jobs, |mut row, job| {
            row.push_bind(job.company_id)
                .push_bind(job.import_job_id)
                .push_bind(job.import_row_index)
                .push_bind(job.title.clone())
                .push_bind(job.description.clone())
                .push_bind(job.location.clone())
                .push_bind(job.department.clone())
                .push_bind(job.employment_type.clone())
                .push_bind(job.experience_level.clone())
                .push_bind(job.remote)
                .push_bind(job.salary_min)
                .push_bind(job.salary_max)
                .push_bind(job.salary_currency.clone())
                .push_bind(job.application_deadline)
                .push_bind(job.contact_email.clone())
                .push_bind(job.external_id.clone())
                .push_bind(IMPORTED_JOB_STATUS);
        });

        let result = query.build().execute(&mut *conn).await?;
        let rows_affected = result.rows_affected();
        debug!("Bulk insert completed: {} rows inserted", rows_affected);

        Ok(rows_affected)
    }

    /// Number of postings created by one import.
    pub async fn count_for_import(conn: &mut PgConnection, import_job_id: i64) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM jobs WHERE import_job_id = $1")
            .bind(import_job_id)
            .fetch_one(&mut *conn)
            .await
    }
}
