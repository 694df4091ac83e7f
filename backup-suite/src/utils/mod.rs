//! Utility modules for the backup suite.

pub mod errors;
pub mod format;
pub mod logger;

pub use errors::{Result, SuiteError};
