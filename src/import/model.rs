use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::config::ConfigDocuments;
use super::error::{ImportFailure, RowError, RowErrorKind};
use super::schema::CanonicalField;
use super::validator::ValidatedRecord;

/// Lifecycle of an import job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportStatus {
    Pending,
    Validating,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl ImportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Validating => "validating",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Claimed by a worker and not yet finished.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Validating | Self::Processing)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for ImportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImportStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "validating" => Ok(Self::Validating),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown import status '{}'", other)),
        }
    }
}

/// Durable record of one bulk upload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImportJob {
    pub id: i64,
    pub company_id: i64,
    pub created_by: i64,
    pub file_url: String,
    pub file_size: i64,
    pub file_name: Option<String>,
    #[serde(flatten)]
    pub documents: ConfigDocuments,
    pub status: ImportStatus,
    pub progress: i16,
    pub total_records: i64,
    pub successful_imports: i64,
    pub failed_imports: i64,
    pub skipped_records: i64,
    pub last_error: Option<ImportFailure>,
    #[serde(skip)]
    pub claimed_by: Option<String>,
    #[serde(skip)]
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub cancel_requested_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ImportJob {
    /// Rows already accounted for; the resume cursor after a restart.
    pub fn processed_rows(&self) -> i64 {
        self.successful_imports + self.failed_imports + self.skipped_records
    }
}

/// Input for creating an import job in `pending`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewImportJob {
    pub company_id: i64,
    pub created_by: i64,
    pub file_url: String,
    pub file_size: i64,
    pub file_name: Option<String>,
    pub documents: ConfigDocuments,
}

/// Progress while a job is still running. 100 is reserved for `completed`.
pub fn progress_for(processed: i64, total: i64) -> i16 {
    if total <= 0 {
        return 0;
    }
    let percent = processed.saturating_mul(100) / total;
    percent.clamp(0, 99) as i16
}

/// A job posting created from one validated row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewJob {
    pub company_id: i64,
    pub import_job_id: Option<i64>,
    pub import_row_index: Option<i64>,
    pub title: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub department: Option<String>,
    pub employment_type: Option<String>,
    pub experience_level: Option<String>,
    pub remote: Option<bool>,
    pub salary_min: Option<f64>,
    pub salary_max: Option<f64>,
    pub salary_currency: Option<String>,
    pub application_deadline: Option<NaiveDate>,
    pub contact_email: Option<String>,
    pub external_id: Option<String>,
}

impl NewJob {
    pub fn from_record(company_id: i64, import_job_id: i64, record: &ValidatedRecord) -> Self {
        Self {
            company_id,
            import_job_id: Some(import_job_id),
            import_row_index: Some(record.row_index as i64),
            title: record.text(CanonicalField::Title).unwrap_or_default(),
            description: record.text(CanonicalField::Description),
            location: record.text(CanonicalField::Location),
            department: record.text(CanonicalField::Department),
            employment_type: record.text(CanonicalField::EmploymentType),
            experience_level: record.text(CanonicalField::ExperienceLevel),
            remote: record.boolean(CanonicalField::Remote),
            salary_min: record.decimal(CanonicalField::SalaryMin),
            salary_max: record.decimal(CanonicalField::SalaryMax),
            salary_currency: record.text(CanonicalField::SalaryCurrency),
            application_deadline: record.date(CanonicalField::ApplicationDeadline),
            contact_email: record.text(CanonicalField::ContactEmail),
            external_id: record.text(CanonicalField::ExternalId),
        }
    }
}

/// Everything one batch commits, applied atomically by the store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchResult {
    pub jobs: Vec<NewJob>,
    pub row_errors: Vec<RowError>,
    pub last_error: Option<ImportFailure>,
}

/// Counter increments derived from a [`BatchResult`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchDelta {
    pub successful: i64,
    pub failed: i64,
    pub skipped: i64,
}

impl BatchDelta {
    pub fn rows(&self) -> i64 {
        self.successful + self.failed + self.skipped
    }
}

impl BatchResult {
    pub fn delta(&self) -> BatchDelta {
        let skipped = self
            .row_errors
            .iter()
            .filter(|e| e.kind == RowErrorKind::Duplicate)
            .count() as i64;
        BatchDelta {
            successful: self.jobs.len() as i64,
            failed: self.row_errors.len() as i64 - skipped,
            skipped,
        }
    }

    /// The same batch with every would-be job turned into a failed row.
    pub fn into_failed(self, reason: &ImportFailure) -> BatchResult {
        let mut row_errors = self.row_errors;
        row_errors.extend(
            self.jobs
                .iter()
                .map(|job| RowError::persistence(job.import_row_index.unwrap_or_default() as u64, &reason.message)),
        );
        row_errors.sort_by_key(|e| e.row_index);
        BatchResult {
            jobs: Vec::new(),
            row_errors,
            last_error: Some(reason.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::import::error::{FailureKind, FieldError};

    fn job(row: i64) -> NewJob {
        NewJob {
            company_id: 1,
            import_job_id: Some(9),
            import_row_index: Some(row),
            title: format!("Job {}", row),
            description: None,
            location: None,
            department: None,
            employment_type: None,
            experience_level: None,
            remote: None,
            salary_min: None,
            salary_max: None,
            salary_currency: None,
            application_deadline: None,
            contact_email: None,
            external_id: None,
        }
    }

    #[test]
    fn progress_never_reaches_100_while_running() {
        assert_eq!(progress_for(0, 0), 0);
        assert_eq!(progress_for(5, 15), 33);
        assert_eq!(progress_for(15, 15), 99);
    }

    #[test]
    fn delta_counts_by_outcome() {
        let batch = BatchResult {
            jobs: vec![job(0), job(2)],
            row_errors: vec![
                RowError::invalid(1, vec![FieldError::new("title", "required value is missing")]),
                RowError::duplicate(3, 0, &[CanonicalField::Title]),
            ],
            last_error: None,
        };
        assert_eq!(
            batch.delta(),
            BatchDelta {
                successful: 2,
                failed: 1,
                skipped: 1
            }
        );
    }

    #[test]
    fn failed_batch_keeps_skips_and_fails_the_rest() {
        let batch = BatchResult {
            jobs: vec![job(0), job(2)],
            row_errors: vec![RowError::duplicate(1, 0, &[CanonicalField::Title])],
            last_error: None,
        };
        let failed = batch.into_failed(&ImportFailure::new(FailureKind::Persistence, "connection reset"));
        let delta = failed.delta();
        assert_eq!((delta.successful, delta.failed, delta.skipped), (0, 2, 1));
        assert_eq!(
            failed.row_errors.iter().map(|e| e.row_index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[test]
    fn status_names_parse_back() {
        assert_eq!("processing".parse::<ImportStatus>(), Ok(ImportStatus::Processing));
        assert!(ImportStatus::Cancelled.is_terminal());
        assert!(!ImportStatus::Pending.is_active());
    }
}
