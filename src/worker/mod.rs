pub mod import_worker;
pub mod registry;
pub mod sweeper;

pub use import_worker::{ImportWorker, WorkerSettings};
pub use registry::CancellationRegistry;
