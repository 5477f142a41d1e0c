//! Bulk job-posting import pipeline.
//!
//! A spreadsheet flows through [`parser`] → [`mapper`] → [`validator`] and is
//! committed in batches by the [`executor`], with all job state held by an
//! [`store::ImportJobStore`].

pub mod config;
pub mod error;
pub mod executor;
pub mod mapper;
pub mod model;
pub mod parser;
pub mod schema;
pub mod source;
pub mod store;
pub mod validator;

pub use config::{ConfigDocuments, ImportConfig};
pub use error::{FailureKind, ImportFailure, RowError, RowErrorKind};
pub use executor::{BatchExecutor, ExecutorSettings, RunOutcome, RunSignals};
pub use model::{ImportJob, ImportStatus, NewImportJob};
pub use source::{FileSource, LocalFileStore};
pub use store::{ImportJobStore, MemoryImportJobStore, StoreError};
