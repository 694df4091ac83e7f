//! Backup executor - Orchestrates one backup run.
//!
//! Collector → codec → manifest store. The run owns its backup directory
//! until the manifest is committed: a cancelled or failed run removes the
//! directory entirely, so a listed backup is always a complete one.

pub mod pool;

use crate::codec::{self, PackOptions};
use crate::collector::{CollectedItem, SourceCollector, COLLECT_PERCENT};
use crate::config::Config;
use crate::manifest::{self, ArchiveEntry, BackupManifest, SuiteLayout, STAGING_DIR};
use crate::utils::errors::{Result, SuiteError};
use crate::utils::format::{format_bytes, format_duration, span_percent};
use crate::ws::{EngineEvent, Reporter};
use chrono::Local;
use pool::{blocking, run_bounded, TaskFailure};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Progress reached once every archive is written
const ARCHIVE_PERCENT: f64 = 95.0;

/// Lifecycle of one run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    Completed,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone)]
pub struct BackupRequest {
    pub target: PathBuf,
    pub directories: Vec<String>,
}

/// Main backup executor
pub struct BackupExecutor {
    config: Arc<Config>,
    collector: SourceCollector,
    reporter: Reporter,
    cancel_token: CancellationToken,
    state: RunState,
}

impl BackupExecutor {
    pub fn new(
        config: Arc<Config>,
        collector: SourceCollector,
        reporter: Reporter,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            config,
            collector,
            reporter,
            cancel_token,
            state: RunState::Idle,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Execute a backup run to a terminal state.
    pub async fn execute(&mut self, request: BackupRequest) -> Result<BackupManifest> {
        if !request.target.is_dir() {
            self.state = RunState::Failed;
            let err = SuiteError::InvalidInput(format!(
                "target {} is not a directory",
                request.target.display()
            ));
            self.reporter.failed(&err);
            return Err(err);
        }

        let started = Local::now();
        let layout = SuiteLayout::new(&request.target);
        let (timestamp, backup_dir) = match layout.reserve_backup_dir() {
            Ok(reserved) => reserved,
            Err(e) => {
                self.state = RunState::Failed;
                self.reporter.failed(&e);
                return Err(e);
            }
        };

        self.state = RunState::Running;
        info!(
            "Starting backup {} to {} ({} director(ies))",
            timestamp,
            backup_dir.display(),
            request.directories.len()
        );
        self.reporter.hub().broadcast(EngineEvent::BackupStarted {
            run_id: self.reporter.run_id().to_string(),
            target: request.target.display().to_string(),
            timestamp: timestamp.clone(),
        });

        let result = self
            .run(&layout, &timestamp, &backup_dir, &request.directories, started)
            .await;

        match result {
            Ok(manifest) => {
                self.state = RunState::Completed;
                info!(
                    "Backup {} completed: {} archive(s), {} -> {} in {}",
                    manifest.timestamp,
                    manifest.entries.len(),
                    format_bytes(manifest.total_source_size_bytes),
                    format_bytes(manifest.total_archive_size_bytes),
                    format_duration(manifest.duration_seconds)
                );
                self.reporter.hub().broadcast(EngineEvent::BackupCompleted {
                    run_id: self.reporter.run_id().to_string(),
                    timestamp: manifest.timestamp.clone(),
                    entries: manifest.entries.len(),
                    total_source_size_bytes: manifest.total_source_size_bytes,
                    total_archive_size_bytes: manifest.total_archive_size_bytes,
                    duration_seconds: manifest.duration_seconds,
                });
                Ok(manifest)
            }
            Err(e) => {
                remove_partial(&backup_dir).await;
                if matches!(e, SuiteError::Cancelled) || self.cancel_token.is_cancelled() {
                    self.state = RunState::Cancelled;
                    info!("Backup {} cancelled, partial data removed", timestamp);
                    self.reporter.hub().broadcast(EngineEvent::BackupCancelled {
                        run_id: self.reporter.run_id().to_string(),
                    });
                    Err(SuiteError::Cancelled)
                } else {
                    self.state = RunState::Failed;
                    self.reporter.error(format!("Backup failed: {}", e));
                    self.reporter.failed(&e);
                    Err(e)
                }
            }
        }
    }

    async fn run(
        &self,
        layout: &SuiteLayout,
        timestamp: &str,
        backup_dir: &Path,
        directories: &[String],
        started: chrono::DateTime<Local>,
    ) -> Result<BackupManifest> {
        let options = Arc::new(PackOptions::from_config(&self.config.backup));
        let collection = self
            .collector
            .collect(
                directories,
                backup_dir,
                options.compression,
                &self.cancel_token,
                &self.reporter,
            )
            .await?;

        if collection.items.is_empty() {
            return Err(SuiteError::Failed {
                message: "no readable sources to back up".to_string(),
                paths: collection.skipped.iter().map(|s| s.path.clone()).collect(),
            });
        }

        info!(
            "Archiving {} item(s), about {}",
            collection.items.len(),
            format_bytes(collection.size_hint())
        );

        let entries = self.archive_items(collection.items, backup_dir, options).await?;

        if self.cancel_token.is_cancelled() {
            return Err(SuiteError::Cancelled);
        }

        let staging = backup_dir.join(STAGING_DIR);
        if staging.exists() {
            tokio::fs::remove_dir_all(&staging).await?;
        }

        let manifest = BackupManifest::new(
            timestamp.to_string(),
            entries,
            started,
            Local::now(),
            collection.skipped,
        );
        let manifest_path = layout.manifest_path(timestamp);
        let to_write = manifest.clone();
        blocking(move || manifest::write_manifest(&manifest_path, &to_write)).await?;

        if let Err(e) = manifest::write_latest(layout, timestamp) {
            warn!("Failed to update latest pointer: {}", e);
        }

        self.reporter.progress(100.0, "Backup complete");
        Ok(manifest)
    }

    /// Pack every item; the first hard failure cancels the remaining ones.
    async fn archive_items(
        &self,
        items: Vec<CollectedItem>,
        backup_dir: &Path,
        options: Arc<PackOptions>,
    ) -> Result<Vec<ArchiveEntry>> {
        let total = items.len();
        let done = Arc::new(AtomicUsize::new(0));
        let abort = self.cancel_token.child_token();

        let inputs: Vec<(String, CollectedItem)> = items
            .into_iter()
            .map(|item| (item.logical_path.clone(), item))
            .collect();

        let outcomes = run_bounded(inputs, self.config.backup.workers, &abort, |item| {
            let archive_path = backup_dir.join(&item.archive_name);
            let options = Arc::clone(&options);
            let reporter = self.reporter.clone();
            let done = Arc::clone(&done);
            let abort = abort.clone();

            async move {
                reporter.info(format!("Archiving {}", item.logical_path));
                let source = item.source_path.clone();
                let packed = blocking(move || codec::pack(&source, &archive_path, &options)).await;

                let outcome = match packed {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        abort.cancel();
                        return Err(e);
                    }
                };

                let finished = done.fetch_add(1, Ordering::SeqCst) + 1;
                reporter.progress(
                    span_percent(COLLECT_PERCENT, ARCHIVE_PERCENT, finished, total),
                    format!(
                        "Archived {} ({} -> {})",
                        item.logical_path,
                        format_bytes(outcome.source_size_bytes),
                        format_bytes(outcome.archive_size_bytes)
                    ),
                );

                Ok(ArchiveEntry {
                    path: item.logical_path,
                    kind: item.kind,
                    archive: item.archive_name,
                    archive_size_bytes: outcome.archive_size_bytes,
                    source_size_bytes: outcome.source_size_bytes,
                    hash: outcome.digest,
                })
            }
        })
        .await;

        let mut entries = Vec::with_capacity(total);
        let mut failure = None;
        for outcome in outcomes {
            match outcome.result {
                Ok(entry) => entries.push(entry),
                // Either the run was cancelled or a sibling failed; the other branch reports it
                Err(TaskFailure::Cancelled) => {}
                Err(TaskFailure::Error(e)) => {
                    failure.get_or_insert(e);
                }
                Err(TaskFailure::Panicked(message)) => {
                    abort.cancel();
                    failure.get_or_insert(SuiteError::Failed {
                        message: format!("archiving {} panicked: {}", outcome.key, message),
                        paths: vec![outcome.key],
                    });
                }
            }
        }

        if self.cancel_token.is_cancelled() {
            return Err(SuiteError::Cancelled);
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(entries),
        }
    }
}

async fn remove_partial(backup_dir: &Path) {
    match tokio::fs::remove_dir_all(backup_dir).await {
        Ok(()) => info!("Removed partial backup {}", backup_dir.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove partial backup {}: {}", backup_dir.display(), e),
    }
}
