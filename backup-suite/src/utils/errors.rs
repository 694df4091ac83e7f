//! Error taxonomy for the backup engine.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SuiteError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Permission denied: {}", .path.display())]
    PermissionDenied { path: PathBuf, message: String },

    #[error("Compression failed for {}: {message}", .path.display())]
    CompressionFailure { path: PathBuf, message: String },

    #[error("Corrupt archive {}: {message}", .path.display())]
    CorruptArchive { path: PathBuf, message: String },

    #[error("Archive {} contains an unsafe entry: {entry}", .archive.display())]
    UnsafeArchivePath { archive: PathBuf, entry: String },

    #[error("Hash mismatch for {path}: expected {expected}, computed {actual}")]
    HashMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("Target {} already has an operation in flight ({operation})", .target.display())]
    TargetBusy { target: PathBuf, operation: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Backup cancelled")]
    Cancelled,

    #[error("{message}")]
    Failed { message: String, paths: Vec<String> },

    #[error("{tool} error: {message}")]
    Tool { tool: String, message: String },

    #[error("Invalid request: {0}")]
    InvalidInput(String),
}

impl SuiteError {
    /// Short machine-readable kind, used in event payloads and API bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            SuiteError::Config(_) => "config",
            SuiteError::Io(_) => "io",
            SuiteError::Serialization(_) => "serialization",
            SuiteError::PermissionDenied { .. } => "permission_denied",
            SuiteError::CompressionFailure { .. } => "compression_failure",
            SuiteError::CorruptArchive { .. } => "corrupt_archive",
            SuiteError::UnsafeArchivePath { .. } => "unsafe_archive_path",
            SuiteError::HashMismatch { .. } => "hash_mismatch",
            SuiteError::TargetBusy { .. } => "target_busy",
            SuiteError::NotFound(_) => "not_found",
            SuiteError::Cancelled => "cancelled",
            SuiteError::Failed { .. } => "failed",
            SuiteError::Tool { .. } => "tool",
            SuiteError::InvalidInput(_) => "invalid_input",
        }
    }

    /// Paths affected by this error, so callers can render actionable detail.
    pub fn paths(&self) -> Vec<String> {
        match self {
            SuiteError::PermissionDenied { path, .. }
            | SuiteError::CompressionFailure { path, .. }
            | SuiteError::CorruptArchive { path, .. } => vec![path.display().to_string()],
            SuiteError::UnsafeArchivePath { archive, entry } => {
                vec![archive.display().to_string(), entry.clone()]
            }
            SuiteError::HashMismatch { path, .. } => vec![path.clone()],
            SuiteError::TargetBusy { target, .. } => vec![target.display().to_string()],
            SuiteError::Failed { paths, .. } => paths.clone(),
            _ => Vec::new(),
        }
    }

    pub(crate) fn compression(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        SuiteError::CompressionFailure {
            path: path.into(),
            message: err.to_string(),
        }
    }

    pub(crate) fn tool(tool: &str, err: impl std::fmt::Display) -> Self {
        SuiteError::Tool {
            tool: tool.to_string(),
            message: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SuiteError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_and_paths() {
        let err = SuiteError::TargetBusy {
            target: PathBuf::from("/Volumes/T"),
            operation: "backup".to_string(),
        };
        assert_eq!(err.kind(), "target_busy");
        assert_eq!(err.paths(), vec!["/Volumes/T".to_string()]);
        assert!(err.to_string().contains("backup"));
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: SuiteError = io.into();
        assert_eq!(err.kind(), "io");
        assert!(err.paths().is_empty());
    }
}
