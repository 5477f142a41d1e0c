//! End-to-end runs of the batch executor against the in-memory store.

use assert_matches::assert_matches;
use chrono::NaiveDate;
use rust_xlsxwriter::{ExcelDateTime, Format, Workbook};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use job_import::import::config::{ConfigDocuments, ImportConfig};
use job_import::import::error::{FailureKind, RowErrorKind};
use job_import::import::executor::{BatchExecutor, ExecutorSettings, RunOutcome, RunSignals};
use job_import::import::mapper::ColumnMapping;
use job_import::import::model::{BatchResult, ImportJob, ImportStatus, NewImportJob, NewJob};
use job_import::import::parser::ParsedSheet;
use job_import::import::schema::CanonicalField;
use job_import::import::source::InMemoryFileSource;
use job_import::import::store::{ImportJobStore, MemoryImportJobStore, StoreError};
use job_import::import::validator::{RowOutcome, RowValidator};
use job_import::worker::{sweeper, CancellationRegistry, ImportWorker, WorkerSettings};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

const LEASE: Duration = Duration::from_secs(60);
const WORKER: &str = "test-worker";
const FILE_URL: &str = "memory://jobs.csv";

struct Harness {
    store: Arc<MemoryImportJobStore>,
    files: Arc<InMemoryFileSource>,
    executor: BatchExecutor,
}

fn harness() -> Harness {
    let store = Arc::new(MemoryImportJobStore::new());
    let files = Arc::new(InMemoryFileSource::new());
    let executor = BatchExecutor::new(
        store.clone(),
        files.clone(),
        ExecutorSettings {
            default_batch_size: 100,
            persistence_retries: 3,
            retry_backoff: Duration::from_millis(1),
        },
    );
    Harness { store, files, executor }
}

impl Harness {
    /// Store `bytes` under `url` and create a pending import of company 1 for it.
    async fn create(&self, url: &str, bytes: &[u8], documents: ConfigDocuments) -> ImportJob {
        self.files.insert(url, bytes.to_vec());
        self.store
            .create(NewImportJob {
                company_id: 1,
                created_by: 7,
                file_url: url.to_string(),
                file_size: bytes.len() as i64,
                file_name: url.rsplit('/').next().map(str::to_string),
                documents,
            })
            .await
            .unwrap()
    }

    /// Create an import for `csv` and claim it, as a worker would.
    async fn start(&self, csv: &str, documents: ConfigDocuments) -> ImportJob {
        let job = self.create(FILE_URL, csv.as_bytes(), documents).await;
        self.store.claim(job.id, WORKER, LEASE).await.unwrap()
    }

    async fn run(&self, job: ImportJob) -> RunOutcome {
        self.executor.run(job, WORKER, &RunSignals::default()).await.unwrap()
    }
}

fn documents(options: serde_json::Value, rules: serde_json::Value) -> ConfigDocuments {
    ConfigDocuments {
        validation_rules: rules,
        options,
        ..ConfigDocuments::default()
    }
}

/// `count` distinct valid postings.
fn postings(count: usize) -> String {
    let mut csv = String::from("Job Title,City,Min Salary,Max Salary\n");
    for i in 0..count {
        csv.push_str(&format!("Engineer {i},Berlin,{},{}\n", 40000 + i, 60000 + i));
    }
    csv
}

/// What a worker would commit for rows `skip..skip + take` of `csv`.
fn batch_of(csv: &str, docs: &ConfigDocuments, job: &ImportJob, skip: usize, take: usize) -> BatchResult {
    let config = ImportConfig::from_documents(docs).unwrap();
    let sheet = ParsedSheet::parse(csv.as_bytes(), &config.parsing).unwrap();
    let mapping = ColumnMapping::resolve(sheet.headers(), &config).unwrap();
    let mut validator = RowValidator::new(&config, &mapping);
    let mut batch = BatchResult::default();
    for (i, row) in sheet.rows_from(0).take(skip + take).enumerate() {
        let outcome = validator.validate(&row);
        if i < skip {
            continue;
        }
        match outcome {
            RowOutcome::Valid(record) => batch.jobs.push(NewJob::from_record(job.company_id, job.id, &record)),
            RowOutcome::Invalid(err) | RowOutcome::Duplicate(err) => batch.row_errors.push(err),
        }
    }
    batch
}

fn assert_counters_add_up(job: &ImportJob) {
    assert_eq!(
        job.total_records,
        job.successful_imports + job.failed_imports + job.skipped_records
    );
}

#[tokio::test]
async fn invalid_and_duplicate_rows_are_counted_separately() {
    let h = harness();
    let csv = "\
Job Title,City,Min Salary,Max Salary
Engineer 0,Berlin,40000,60000
Engineer 1,Berlin,40000,60000
Engineer 2,Berlin,40000,60000
Engineer 3,Berlin,-500,
Engineer 4,Hamburg,40000,60000
Engineer 4,Hamburg,40000,60000
Engineer 4,Hamburg,40000,60000
Engineer 7,Berlin,40000,60000
Engineer 8,Berlin,40000,60000
Engineer 9,Berlin,40000,60000
";
    let job = h
        .start(
            csv,
            documents(
                json!({"batch_size": 4, "duplicates": {"fields": ["title", "location"]}}),
                json!({"salary_min": [{"kind": "range", "min": 0}]}),
            ),
        )
        .await;

    let outcome = h.run(job).await;
    let job = assert_matches!(outcome, RunOutcome::Completed(job) => job);

    assert_eq!(job.status, ImportStatus::Completed);
    assert_eq!(job.total_records, 10);
    assert_eq!(job.successful_imports, 7);
    assert_eq!(job.failed_imports, 1);
    assert_eq!(job.skipped_records, 2);
    assert_eq!(job.progress, 100);
    assert!(job.completed_at.is_some());
    assert_counters_add_up(&job);

    let errors = h.store.row_errors(job.id).await.unwrap();
    assert_eq!(errors.len(), 3);
    assert_eq!(errors[0].row_index, 3);
    assert_eq!(errors[0].kind, RowErrorKind::Invalid);
    assert!(errors[0].mentions(CanonicalField::SalaryMin));
    for (err, row) in errors[1..].iter().zip([5, 6]) {
        assert_eq!(err.row_index, row);
        assert_eq!(err.kind, RowErrorKind::Duplicate);
        assert_eq!(err.errors[0].reason, "duplicate of row 4");
    }

    let created: Vec<i64> = h
        .store
        .created_jobs(job.id)
        .iter()
        .filter_map(|j| j.import_row_index)
        .collect();
    assert_eq!(created, vec![0, 1, 2, 4, 7, 8, 9]);
}

#[tokio::test]
async fn cancellation_stops_at_the_next_batch_boundary() {
    let h = harness();
    let job = h.start(&postings(15), documents(json!({"batch_size": 5}), json!(null))).await;
    h.store.cancel_after_batches(job.id, 1);

    let outcome = h.run(job).await;
    let job = assert_matches!(outcome, RunOutcome::Cancelled(job) => job);

    assert_eq!(job.status, ImportStatus::Cancelled);
    assert_eq!(job.total_records, 15);
    assert_eq!(job.successful_imports, 5);
    assert_eq!(job.failed_imports + job.skipped_records, 0);
    assert!(job.cancelled_at.is_some());
    // Committed postings stay.
    assert_eq!(h.store.created_jobs(job.id).len(), 5);

    // A terminal job does not change again.
    let first_cancel = job.cancelled_at;
    assert_matches!(h.store.cancel(job.id, WORKER).await, Err(StoreError::Inactive(_)));
    let unchanged = h.store.request_cancel(job.id).await.unwrap();
    assert_eq!(unchanged.cancelled_at, first_cancel);
    assert_eq!(unchanged.status, ImportStatus::Cancelled);
}

#[tokio::test]
async fn cancellation_token_stops_before_any_batch() {
    let h = harness();
    let job = h.start(&postings(3), ConfigDocuments::default()).await;

    let signals = RunSignals::default();
    signals.cancel.cancel();
    let outcome = h.executor.run(job, WORKER, &signals).await.unwrap();
    let job = assert_matches!(outcome, RunOutcome::Cancelled(job) => job);

    assert_eq!(job.processed_rows(), 0);
    assert!(h.store.created_jobs(job.id).is_empty());
}

#[tokio::test]
async fn missing_required_column_fails_the_whole_file() {
    let h = harness();
    let job = h
        .start("City,Department\nBerlin,Engineering\nParis,Sales\n", ConfigDocuments::default())
        .await;

    let outcome = h.run(job).await;
    let job = assert_matches!(outcome, RunOutcome::Failed(job) => job);

    assert_eq!(job.status, ImportStatus::Failed);
    assert_eq!(
        (job.total_records, job.successful_imports, job.failed_imports, job.skipped_records),
        (0, 0, 0, 0)
    );
    let failure = job.last_error.unwrap();
    assert_eq!(failure.kind, FailureKind::Mapping);
    assert!(failure.message.contains("title"));
    assert!(h.store.row_errors(job.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn unreadable_file_fails_with_a_parse_error() {
    let h = harness();
    let job = h
        .start("Title,City\nEngineer,Berlin,Remote,Extra\n", ConfigDocuments::default())
        .await;

    let job = assert_matches!(h.run(job).await, RunOutcome::Failed(job) => job);
    assert_eq!(job.last_error.as_ref().unwrap().kind, FailureKind::Parse);
    assert_eq!(job.processed_rows(), 0);
}

#[tokio::test]
async fn empty_file_fails_with_a_parse_error() {
    let h = harness();
    let job = h.start("", ConfigDocuments::default()).await;

    let job = assert_matches!(h.run(job).await, RunOutcome::Failed(job) => job);
    assert_eq!(job.last_error.unwrap().kind, FailureKind::Parse);
}

#[tokio::test]
async fn header_only_file_completes_with_zero_records() {
    let h = harness();
    let job = h.start("Title,City\n", ConfigDocuments::default()).await;

    let job = assert_matches!(h.run(job).await, RunOutcome::Completed(job) => job);
    assert_eq!(job.total_records, 0);
    assert_eq!(job.processed_rows(), 0);
    assert_eq!(job.progress, 100);
}

#[tokio::test]
async fn progress_only_moves_forward_and_ends_at_100() {
    let h = harness();
    let job = h.start(&postings(23), documents(json!({"batch_size": 5}), json!(null))).await;

    let job = assert_matches!(h.run(job).await, RunOutcome::Completed(job) => job);
    let history = h.store.progress_history(job.id);

    assert_eq!(history.len(), 6);
    assert!(history.windows(2).all(|w| w[0] <= w[1]));
    assert!(history[..5].iter().all(|p| *p < 100));
    assert_eq!(history.last(), Some(&100));
}

#[tokio::test]
async fn transient_commit_failures_are_retried() {
    let h = harness();
    let job = h.start(&postings(4), ConfigDocuments::default()).await;
    h.store.fail_next_commits(2);

    let job = assert_matches!(h.run(job).await, RunOutcome::Completed(job) => job);
    assert_eq!(job.successful_imports, 4);
    assert_eq!(job.failed_imports, 0);
    assert!(job.last_error.is_none());
}

#[tokio::test]
async fn exhausted_retries_fail_the_batch_rows_and_continue() {
    let h = harness();
    let job = h.start(&postings(6), documents(json!({"batch_size": 3}), json!(null))).await;
    // The first attempt plus three retries of batch one.
    h.store.fail_next_commits(4);

    let job = assert_matches!(h.run(job).await, RunOutcome::Completed(job) => job);
    assert_eq!(job.successful_imports, 3);
    assert_eq!(job.failed_imports, 3);
    assert_counters_add_up(&job);
    assert_eq!(job.last_error.as_ref().map(|e| e.kind), Some(FailureKind::Persistence));

    let errors = h.store.row_errors(job.id).await.unwrap();
    assert_eq!(errors.iter().map(|e| e.row_index).collect::<Vec<_>>(), vec![0, 1, 2]);
    assert!(errors.iter().all(|e| e.kind == RowErrorKind::Persistence));
}

#[tokio::test]
async fn resumed_import_skips_committed_rows_and_keeps_duplicate_state() {
    let h = harness();
    let mut csv = postings(8);
    // Row 8 repeats row 1, across the resume boundary.
    csv.push_str("Engineer 1,Berlin,40001,60001\n");
    let docs = documents(
        json!({"batch_size": 5, "duplicates": {"fields": ["title"]}}),
        json!(null),
    );
    let job = h.start(&csv, docs.clone()).await;

    // A first worker committed rows 0..5 and then died.
    let first = batch_of(&csv, &docs, &job, 0, 5);
    h.store.set_total_records(job.id, WORKER, 9).await.unwrap();
    h.store.mark_processing(job.id, WORKER).await.unwrap();
    h.store.apply_batch_result(job.id, WORKER, 0, &first).await.unwrap();
    h.store.expire_claim(job.id);

    let resumed = h.store.claim(job.id, "second-worker", LEASE).await.unwrap();
    assert_eq!(resumed.status, ImportStatus::Processing);
    assert_eq!(resumed.processed_rows(), 5);

    let outcome = h.executor.run(resumed, "second-worker", &RunSignals::default()).await.unwrap();
    let job = assert_matches!(outcome, RunOutcome::Completed(job) => job);

    assert_eq!(job.total_records, 9);
    assert_eq!(job.successful_imports, 8);
    assert_eq!(job.skipped_records, 1);
    assert_counters_add_up(&job);

    let rows: Vec<i64> = h
        .store
        .created_jobs(job.id)
        .iter()
        .filter_map(|j| j.import_row_index)
        .collect();
    assert_eq!(rows, (0..8).collect::<Vec<_>>());
    let errors = h.store.row_errors(job.id).await.unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].row_index, 8);
    assert_eq!(errors[0].errors[0].reason, "duplicate of row 1");
}

#[tokio::test]
async fn worker_that_lost_its_claim_cannot_write_behind_the_new_holder() {
    let h = harness();
    let csv = postings(6);
    let docs = documents(json!({"batch_size": 3}), json!(null));
    let job = h.start(&csv, docs.clone()).await;
    h.store.set_total_records(job.id, WORKER, 6).await.unwrap();
    let stale = batch_of(&csv, &docs, &job, 0, 3);

    // The first worker stalls past its lease and another one takes over.
    h.store.expire_claim(job.id);
    let taken = h.store.claim(job.id, "second-worker", LEASE).await.unwrap();

    assert_eq!(
        h.store.apply_batch_result(job.id, WORKER, 0, &stale).await.unwrap_err(),
        StoreError::AlreadyClaimed(job.id)
    );
    assert_eq!(
        h.store.complete(job.id, WORKER).await.unwrap_err(),
        StoreError::AlreadyClaimed(job.id)
    );
    assert_eq!(h.store.get(job.id).await.unwrap().processed_rows(), 0);

    // Waking up, the first worker notices and steps aside.
    let outcome = h.executor.run(job.clone(), WORKER, &RunSignals::default()).await.unwrap();
    let current = assert_matches!(outcome, RunOutcome::Abandoned(job) => job);
    assert_eq!(current.claimed_by.as_deref(), Some("second-worker"));

    let outcome = h.executor.run(taken, "second-worker", &RunSignals::default()).await.unwrap();
    let job = assert_matches!(outcome, RunOutcome::Completed(job) => job);
    assert_eq!(job.successful_imports, 6);
    assert_counters_add_up(&job);
    assert_eq!(h.store.created_jobs(job.id).len(), 6);
}

#[tokio::test]
async fn second_import_of_a_company_waits_for_the_first() {
    let h = harness();
    let first = h.create("memory://first.csv", postings(2).as_bytes(), ConfigDocuments::default()).await;
    let second = h.create("memory://second.csv", postings(3).as_bytes(), ConfigDocuments::default()).await;

    assert_eq!(h.store.list_claimable(LEASE, 10).await.unwrap(), vec![first.id]);
    assert_eq!(
        h.store.claim(second.id, "other-worker", LEASE).await.unwrap_err(),
        StoreError::ImportInProgress(1)
    );

    let first = h.store.claim(first.id, WORKER, LEASE).await.unwrap();
    assert!(h.store.list_claimable(LEASE, 10).await.unwrap().is_empty());
    assert_eq!(
        h.store.claim(second.id, "other-worker", LEASE).await.unwrap_err(),
        StoreError::ImportInProgress(1)
    );
    assert_eq!(h.store.get(second.id).await.unwrap().status, ImportStatus::Pending);

    assert_matches!(h.run(first).await, RunOutcome::Completed(_));
    assert_eq!(h.store.list_claimable(LEASE, 10).await.unwrap(), vec![second.id]);
    let second = h.store.claim(second.id, "other-worker", LEASE).await.unwrap();
    let outcome = h.executor.run(second, "other-worker", &RunSignals::default()).await.unwrap();
    let job = assert_matches!(outcome, RunOutcome::Completed(job) => job);
    assert_eq!(job.successful_imports, 3);
}

#[tokio::test]
async fn spreadsheet_dates_become_posting_deadlines() {
    let mut workbook = Workbook::new();
    let date_format = Format::new().set_num_format("dd/mm/yyyy");
    let sheet = workbook.add_worksheet();
    sheet.write_string(0, 0, "Job Title").unwrap();
    sheet.write_string(0, 1, "Deadline").unwrap();
    sheet.write_string(1, 0, "Engineer").unwrap();
    let deadline = ExcelDateTime::from_ymd(2030, 1, 31).unwrap();
    sheet.write_datetime_with_format(1, 1, &deadline, &date_format).unwrap();
    let bytes = workbook.save_to_buffer().unwrap();

    let h = harness();
    let job = h
        .create(
            "memory://jobs.xlsx",
            &bytes,
            documents(json!(null), json!({"application_deadline": [{"kind": "required"}]})),
        )
        .await;
    let job = h.store.claim(job.id, WORKER, LEASE).await.unwrap();

    let job = assert_matches!(h.run(job).await, RunOutcome::Completed(job) => job);
    assert_eq!((job.successful_imports, job.failed_imports), (1, 0));
    let created = h.store.created_jobs(job.id);
    assert_eq!(created[0].title, "Engineer");
    assert_eq!(created[0].application_deadline, NaiveDate::from_ymd_opt(2030, 1, 31));
}

#[tokio::test]
async fn shutdown_suspends_and_releases_the_claim() {
    let h = harness();
    let job = h.start(&postings(3), ConfigDocuments::default()).await;

    let signals = RunSignals::default();
    signals.shutdown.cancel();
    let outcome = h.executor.run(job, WORKER, &signals).await.unwrap();
    let job = assert_matches!(outcome, RunOutcome::Suspended(job) => job);
    assert_eq!(job.status, ImportStatus::Validating);

    // Another worker picks it up straight away and finishes it.
    assert_eq!(h.store.list_claimable(LEASE, 10).await.unwrap(), vec![job.id]);
    let reclaimed = h.store.claim(job.id, "next-worker", LEASE).await.unwrap();
    let outcome = h.executor.run(reclaimed, "next-worker", &RunSignals::default()).await.unwrap();
    let job = assert_matches!(outcome, RunOutcome::Completed(job) => job);
    assert_eq!(job.successful_imports, 3);
}

#[tokio::test]
async fn timed_out_import_is_abandoned_by_its_worker() {
    let h = harness();
    let job = h.start(&postings(3), ConfigDocuments::default()).await;
    h.store.backdate_start(job.id, Duration::from_secs(7200));

    let registry = CancellationRegistry::new();
    let token = registry.register(job.id);
    let failed = sweeper::sweep_once(h.store.as_ref(), &registry, Duration::from_secs(3600))
        .await
        .unwrap();
    assert_eq!(failed, vec![job.id]);
    assert!(token.is_cancelled());

    let outcome = h.run(job).await;
    let job = assert_matches!(outcome, RunOutcome::Abandoned(job) => job);
    assert_eq!(job.status, ImportStatus::Failed);
    assert_eq!(job.last_error.unwrap().kind, FailureKind::Timeout);
    assert!(h.store.created_jobs(job.id).is_empty());
}

#[tokio::test]
async fn same_file_and_config_give_the_same_outcome() {
    let csv = "\
Title,Email,Remote,Deadline
Engineer,eng@example.com,yes,2030-01-31
,nobody@example.com,no,2030-01-31
Designer,not-an-email,maybe,31/01/2030
Engineer,eng@example.com,yes,2030-01-31
";
    let docs = documents(json!({"duplicates": {"fields": ["title", "contact_email"]}}), json!(null));

    let mut runs = Vec::new();
    for _ in 0..2 {
        let h = harness();
        let job = h.start(csv, docs.clone()).await;
        let job = assert_matches!(h.run(job).await, RunOutcome::Completed(job) => job);
        runs.push((
            h.store.row_errors(job.id).await.unwrap(),
            h.store.created_jobs(job.id),
            (job.successful_imports, job.failed_imports, job.skipped_records),
        ));
    }
    assert_eq!(runs[0], runs[1]);

    let (errors, created, counters) = &runs[0];
    assert_eq!(*counters, (1, 2, 1));
    assert_eq!(created[0].remote, Some(true));
    // Row 1 misses its title; row 2 collects every violation in one entry.
    assert!(errors[0].mentions(CanonicalField::Title));
    assert_eq!(errors[0].row_index, 1);
    assert_eq!(errors[1].row_index, 2);
    assert_eq!(errors[1].errors.len(), 3);
}

#[tokio::test]
async fn worker_claims_and_finishes_pending_imports() {
    let store = Arc::new(MemoryImportJobStore::new());
    let files = Arc::new(InMemoryFileSource::new());
    let registry = Arc::new(CancellationRegistry::new());
    let executor = Arc::new(BatchExecutor::new(store.clone(), files.clone(), ExecutorSettings::default()));

    let mut ids = Vec::new();
    for company_id in [1, 2] {
        let url = format!("memory://company-{company_id}.csv");
        files.insert(url.clone(), postings(4).into_bytes());
        let job = store
            .create(NewImportJob {
                company_id,
                created_by: 7,
                file_url: url,
                file_size: 0,
                file_name: None,
                documents: ConfigDocuments::default(),
            })
            .await
            .unwrap();
        ids.push(job.id);
    }

    let worker = ImportWorker::new(
        store.clone(),
        executor,
        registry.clone(),
        WorkerSettings {
            claim_lease: LEASE,
            poll_interval: Duration::from_millis(10),
        },
    );
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { worker.run(1, Arc::new(Semaphore::new(2)), shutdown).await }
    });

    let finished = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let mut done = true;
            for id in &ids {
                done &= store.get(*id).await.unwrap().status.is_terminal();
            }
            if done {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(finished.is_ok(), "imports did not finish in time");

    shutdown.cancel();
    handle.await.unwrap();

    for id in ids {
        let job = store.get(id).await.unwrap();
        assert_eq!(job.status, ImportStatus::Completed);
        assert_eq!(job.successful_imports, 4);
        assert!(job.claimed_by.is_none());
    }
    assert!(registry.is_empty());
}
