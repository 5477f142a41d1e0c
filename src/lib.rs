pub mod api;
pub mod cli;
pub mod config;
pub mod db;
pub mod import;
pub mod logging;
pub mod shutdown;
pub mod worker;
