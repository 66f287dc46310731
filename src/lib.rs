// Library module for driftsync
// Re-exports modules for use in integration tests and the binary

pub mod config;
pub mod console;
pub mod error;
pub mod fs;
pub mod logging;
pub mod runner;
pub mod sync;

pub use error::{Result, SyncError};
