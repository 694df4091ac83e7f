//! Backup Suite Library
//!
//! Backup, verification and restore engine for user directories and machine
//! state, served over HTTP and WebSocket by the `backup-suite` daemon.

pub mod api;
pub mod catalog;
pub mod codec;
pub mod collector;
pub mod config;
pub mod daemon;
pub mod engine;
pub mod executor;
pub mod fs;
pub mod locks;
pub mod manifest;
pub mod restore;
pub mod tools;
pub mod utils;
pub mod verify;
pub mod ws;

// Re-export commonly used types
pub use config::Config;
pub use engine::{Collaborators, Engine};
pub use utils::errors::{Result, SuiteError};
