//! Daemon lifecycle.

pub mod shutdown;
