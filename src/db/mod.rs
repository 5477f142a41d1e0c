pub mod connection;
pub mod import_job_repository;
pub mod job_repository;
pub mod migrations;
pub mod models;

pub use import_job_repository::PgImportJobStore;
