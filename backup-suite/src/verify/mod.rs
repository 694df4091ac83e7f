//! Verification engine.
//!
//! Recomputes every archive digest and compares it with the manifest. Read
//! only: marking a backup verified is a separate manifest-store operation.

use crate::codec::hash_file;
use crate::executor::pool::{blocking, run_bounded, TaskFailure};
use crate::manifest::{ArchiveEntry, BackupManifest};
use crate::utils::errors::{Result, SuiteError};
use crate::utils::format::span_percent;
use crate::ws::Reporter;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifyFailure {
    pub path: String,
    pub archive: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifyReport {
    pub success: bool,
    pub total_count: usize,
    pub verified_count: usize,
    /// Logical paths of entries that did not verify, in manifest order
    pub failed_paths: Vec<String>,
    pub failures: Vec<VerifyFailure>,
    pub message: String,
}

/// Check every entry of `manifest` against the archives in `backup_dir`.
pub async fn verify_backup(
    backup_dir: &Path,
    manifest: &BackupManifest,
    workers: usize,
    reporter: &Reporter,
) -> VerifyReport {
    let total = manifest.entries.len();
    let done = Arc::new(AtomicUsize::new(0));
    reporter.progress(0.0, format!("Verifying {} archive(s)", total));

    let inputs: Vec<(String, ArchiveEntry)> = manifest
        .entries
        .iter()
        .map(|e| (e.path.clone(), e.clone()))
        .collect();

    let outcomes = run_bounded(inputs, workers, &CancellationToken::new(), |entry| {
        let backup_dir = backup_dir.to_path_buf();
        let reporter = reporter.clone();
        let done = Arc::clone(&done);
        async move {
            let result = check_entry(backup_dir, entry.clone()).await;
            let finished = done.fetch_add(1, Ordering::SeqCst) + 1;
            reporter.progress(
                span_percent(0.0, 100.0, finished, total),
                format!("Checked {}", entry.path),
            );
            result
        }
    })
    .await;

    let mut failures = Vec::new();
    for (outcome, entry) in outcomes.into_iter().zip(&manifest.entries) {
        let reason = match outcome.result {
            Ok(()) => continue,
            Err(TaskFailure::Error(e)) => e.to_string(),
            Err(other) => other.to_string(),
        };
        warn!("Verification failed for {}: {}", entry.path, reason);
        failures.push(VerifyFailure {
            path: entry.path.clone(),
            archive: entry.archive.clone(),
            reason,
        });
    }

    let verified_count = total - failures.len();
    let success = failures.is_empty();
    let message = if success {
        format!("All {} archive(s) verified", total)
    } else {
        format!("{} of {} archive(s) failed verification", failures.len(), total)
    };
    info!("Verification of {}: {}", manifest.timestamp, message);

    VerifyReport {
        success,
        total_count: total,
        verified_count,
        failed_paths: failures.iter().map(|f| f.path.clone()).collect(),
        failures,
        message,
    }
}

async fn check_entry(backup_dir: PathBuf, entry: ArchiveEntry) -> Result<()> {
    if !is_plain_file_name(&entry.archive) {
        return Err(SuiteError::InvalidInput(format!(
            "archive name {:?} is not a plain file name",
            entry.archive
        )));
    }

    let archive = backup_dir.join(&entry.archive);
    let actual = blocking(move || match hash_file(&archive) {
        Ok(digest) => Ok(digest),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(SuiteError::NotFound(format!(
            "archive {} is missing",
            archive.display()
        ))),
        Err(e) => Err(e.into()),
    })
    .await?;

    if actual.eq_ignore_ascii_case(&entry.hash) {
        Ok(())
    } else {
        Err(SuiteError::HashMismatch {
            path: entry.path,
            expected: entry.hash,
            actual,
        })
    }
}

/// Manifest archive names must never reach outside the backup directory.
pub(crate) fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::SourceKind;
    use crate::ws::{Channel, EventHub};
    use chrono::Local;
    use std::fs;
    use tempfile::TempDir;

    fn manifest_for(dir: &Path, names: &[&str]) -> std::io::Result<BackupManifest> {
        let mut entries = Vec::new();
        for name in names {
            let archive = format!("{}.tar.zst", name);
            fs::write(dir.join(&archive), format!("archive bytes for {}", name))?;
            entries.push(ArchiveEntry {
                path: format!("/src/{}", name),
                kind: SourceKind::FilesystemPath,
                hash: hash_file(&dir.join(&archive))?,
                archive,
                archive_size_bytes: 0,
                source_size_bytes: 0,
            });
        }
        let now = Local::now();
        Ok(BackupManifest::new("20240101-000000".to_string(), entries, now, now, Vec::new()))
    }

    fn reporter() -> Reporter {
        Reporter::new(EventHub::new(64), "verify", Channel::Verify)
    }

    #[tokio::test]
    async fn test_untouched_backup_verifies_repeatably() -> std::io::Result<()> {
        let temp = TempDir::new()?;
        let manifest = manifest_for(temp.path(), &["a", "b", "c"])?;

        let first = verify_backup(temp.path(), &manifest, 4, &reporter()).await;
        let second = verify_backup(temp.path(), &manifest, 4, &reporter()).await;
        assert!(first.success);
        assert_eq!(first.verified_count, 3);
        assert_eq!(first.success, second.success);
        assert_eq!(first.failed_paths, second.failed_paths);
        Ok(())
    }

    #[tokio::test]
    async fn test_flipped_byte_fails_only_that_entry() -> std::io::Result<()> {
        let temp = TempDir::new()?;
        let manifest = manifest_for(temp.path(), &["a", "b", "c"])?;

        let target = temp.path().join("b.tar.zst");
        let mut bytes = fs::read(&target)?;
        bytes[0] ^= 0x01;
        fs::write(&target, bytes)?;

        let report = verify_backup(temp.path(), &manifest, 2, &reporter()).await;
        assert!(!report.success);
        assert_eq!(report.failed_paths, vec!["/src/b".to_string()]);
        assert_eq!(report.verified_count, 2);
        assert!(report.failures[0].reason.contains("Hash mismatch"));
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_archive_is_a_failure() -> std::io::Result<()> {
        let temp = TempDir::new()?;
        let manifest = manifest_for(temp.path(), &["a", "b"])?;
        fs::remove_file(temp.path().join("a.tar.zst"))?;

        let report = verify_backup(temp.path(), &manifest, 4, &reporter()).await;
        assert_eq!(report.failed_paths, vec!["/src/a".to_string()]);
        assert!(report.failures[0].reason.contains("missing"));
        Ok(())
    }

    #[tokio::test]
    async fn test_traversing_archive_name_rejected() -> std::io::Result<()> {
        let temp = TempDir::new()?;
        let mut manifest = manifest_for(temp.path(), &["a"])?;
        manifest.entries[0].archive = "../a.tar.zst".to_string();

        let report = verify_backup(temp.path(), &manifest, 1, &reporter()).await;
        assert!(!report.success);
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_manifest_succeeds() {
        let now = Local::now();
        let manifest = BackupManifest::new("20240101-000000".to_string(), Vec::new(), now, now, Vec::new());
        let report = verify_backup(Path::new("/nonexistent"), &manifest, 4, &reporter()).await;
        assert!(report.success);
        assert_eq!(report.total_count, 0);
    }
}
