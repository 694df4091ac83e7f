//! Engine facade.
//!
//! One `Engine` per daemon. It owns the configuration, the collaborators, the
//! event hub and the per-target locks, and exposes every boundary operation:
//! backup, cancel, list, details, verify, restore, quick restore, delete,
//! manual apps, volumes and permission checks.

use crate::catalog::{self, BackupSummary};
use crate::collector::SourceCollector;
use crate::config::Config;
use crate::executor::pool::blocking;
use crate::executor::{BackupExecutor, BackupRequest};
use crate::fs::{FsPermissionProbe, MountedVolumes, PermissionCheck, PermissionProbe, Volume, VolumeEnumerator};
use crate::locks::{target_key, TargetGuard, TargetLocks};
use crate::manifest::{self, BackupManifest, MANIFEST_FILE};
use crate::restore::{RestoreEngine, RestoreRequest, RestoreResult};
use crate::tools::Toolchain;
use crate::utils::errors::Result;
use crate::verify::{self, VerifyReport};
use crate::ws::{Channel, EngineEvent, EventHub, Reporter};
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Everything outside the process the engine talks to
#[derive(Clone)]
pub struct Collaborators {
    pub tools: Toolchain,
    pub probe: Arc<dyn PermissionProbe>,
    pub volumes: Arc<dyn VolumeEnumerator>,
    /// Home directory that `~` paths and restores resolve against
    pub home: PathBuf,
}

impl Collaborators {
    /// Real CLIs, filesystem probe and mounted volumes of this host.
    pub fn host(config: &Config) -> Self {
        Self {
            tools: Toolchain::host(&config.tools),
            probe: Arc::new(FsPermissionProbe),
            volumes: Arc::new(MountedVolumes::new(&config.volumes)),
            home: dirs::home_dir().unwrap_or_else(|| PathBuf::from("/")),
        }
    }
}

/// A backup in flight
struct RunningBackup {
    target: PathBuf,
    cancel: CancellationToken,
}

#[derive(Clone)]
pub struct Engine {
    config: Arc<Config>,
    collaborators: Collaborators,
    events: EventHub,
    locks: TargetLocks,
    running: Arc<DashMap<String, RunningBackup>>,
    shutdown: CancellationToken,
}

/// Removes a run from the registry when the run ends, however it ends
struct RunRegistration {
    running: Arc<DashMap<String, RunningBackup>>,
    run_id: String,
}

impl Drop for RunRegistration {
    fn drop(&mut self) {
        self.running.remove(&self.run_id);
    }
}

/// What a backup run holds until it ends: the target lock and its
/// registration as a cancellable run
struct RunTicket {
    _guard: TargetGuard,
    registration: RunRegistration,
    cancel: CancellationToken,
}

impl Engine {
    pub fn new(config: Config, collaborators: Collaborators) -> Self {
        let events = EventHub::new(config.events.capacity);
        Self {
            config: Arc::new(config),
            collaborators,
            events,
            locks: TargetLocks::new(),
            running: Arc::new(DashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn events(&self) -> &EventHub {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Run a backup to completion.
    pub async fn create_backup(&self, target: &Path, directories: Vec<String>) -> Result<BackupManifest> {
        let ticket = self.begin_backup(target)?;
        self.run_backup(ticket, target.to_path_buf(), directories).await
    }

    /// Start a backup in the background. The target is claimed and the run
    /// is cancellable before this returns.
    pub fn spawn_backup(
        &self,
        target: &Path,
        directories: Vec<String>,
    ) -> Result<(String, JoinHandle<Result<BackupManifest>>)> {
        let ticket = self.begin_backup(target)?;
        let run_id = ticket.registration.run_id.clone();
        let engine = self.clone();
        let target = target.to_path_buf();
        let handle = tokio::spawn(async move { engine.run_backup(ticket, target, directories).await });
        Ok((run_id, handle))
    }

    fn begin_backup(&self, target: &Path) -> Result<RunTicket> {
        let guard = self.locks.try_acquire(target, "backup")?;
        let run_id = Uuid::new_v4().to_string();
        let cancel = self.shutdown.child_token();
        self.running.insert(
            run_id.clone(),
            RunningBackup {
                target: target_key(target),
                cancel: cancel.clone(),
            },
        );
        Ok(RunTicket {
            _guard: guard,
            registration: RunRegistration {
                running: Arc::clone(&self.running),
                run_id,
            },
            cancel,
        })
    }

    async fn run_backup(
        &self,
        ticket: RunTicket,
        target: PathBuf,
        directories: Vec<String>,
    ) -> Result<BackupManifest> {
        let reporter = Reporter::new(
            self.events.clone(),
            ticket.registration.run_id.clone(),
            Channel::Backup,
        );
        let collector = SourceCollector::new(
            Arc::clone(&self.config),
            self.collaborators.tools.clone(),
            Arc::clone(&self.collaborators.probe),
            self.collaborators.home.clone(),
        );
        let mut executor =
            BackupExecutor::new(Arc::clone(&self.config), collector, reporter, ticket.cancel.clone());
        executor.execute(BackupRequest { target, directories }).await
    }

    /// Signal the backup on `target`, or every running backup. Returns how
    /// many runs were signalled.
    pub fn cancel_backup(&self, target: Option<&Path>) -> usize {
        let wanted = target.map(target_key);
        let mut cancelled = 0;
        for run in self.running.iter() {
            if wanted.as_ref().map_or(true, |t| *t == run.target) {
                run.cancel.cancel();
                cancelled += 1;
                info!("Cancelling backup {} on {}", run.key(), run.target.display());
            }
        }
        cancelled
    }

    pub async fn list_backups(&self, target: &Path) -> Result<Vec<BackupSummary>> {
        let target = target.to_path_buf();
        blocking(move || catalog::list_backups(&target)).await
    }

    pub async fn get_backup_details(&self, target: &Path, timestamp: &str) -> Result<BackupManifest> {
        let target = target.to_path_buf();
        let timestamp = timestamp.to_string();
        blocking(move || catalog::get_manifest(&target, &timestamp)).await
    }

    /// Backup directory and manifest of one backup, read off the runtime threads.
    async fn load_backup(&self, target: &Path, timestamp: &str) -> Result<(PathBuf, BackupManifest)> {
        let target = target.to_path_buf();
        let timestamp = timestamp.to_string();
        blocking(move || {
            let dir = catalog::backup_dir(&target, &timestamp)?;
            let backup = manifest::read_manifest(&dir.join(MANIFEST_FILE))?;
            Ok((dir, backup))
        })
        .await
    }

    fn restore_engine(&self) -> RestoreEngine {
        let reporter = Reporter::new(self.events.clone(), Uuid::new_v4().to_string(), Channel::Restore);
        RestoreEngine::new(
            Arc::clone(&self.config),
            self.collaborators.tools.clone(),
            self.collaborators.home.clone(),
            reporter,
        )
    }

    /// Recompute every digest; a clean result is recorded in the manifest.
    pub async fn verify_backup(&self, target: &Path, timestamp: &str) -> Result<VerifyReport> {
        let (dir, backup) = self.load_backup(target, timestamp).await?;
        let manifest_path = dir.join(MANIFEST_FILE);

        let reporter = Reporter::new(self.events.clone(), Uuid::new_v4().to_string(), Channel::Verify);
        let report =
            verify::verify_backup(&dir, &backup, self.config.performance.verify_workers, &reporter).await;

        if report.success {
            blocking(move || manifest::mark_verified(&manifest_path)).await?;
        }
        Ok(report)
    }

    pub async fn restore_items(
        &self,
        target: &Path,
        timestamp: &str,
        request: RestoreRequest,
    ) -> Result<RestoreResult> {
        let _guard = self.locks.try_acquire(target, "restore")?;
        let (dir, backup) = self.load_backup(target, timestamp).await?;
        Ok(self.restore_engine().restore(&dir, &backup, &request).await)
    }

    /// Install the essential packages a backup's package inventory lists.
    pub async fn quick_restore(&self, target: &Path, timestamp: &str) -> Result<RestoreResult> {
        let _guard = self.locks.try_acquire(target, "restore")?;
        let (dir, backup) = self.load_backup(target, timestamp).await?;
        self.restore_engine().quick_restore(&dir, &backup).await
    }

    pub async fn delete_backup(&self, target: &Path, timestamp: &str) -> Result<()> {
        let _guard = self.locks.try_acquire(target, "delete")?;
        let target = target.to_path_buf();
        let timestamp = timestamp.to_string();
        blocking(move || catalog::delete_backup(&target, &timestamp)).await
    }

    pub async fn get_manual_apps(&self, target: &Path, timestamp: &str) -> Result<Vec<String>> {
        let target = target.to_path_buf();
        let timestamp = timestamp.to_string();
        blocking(move || catalog::manual_apps(&target, &timestamp)).await
    }

    pub async fn list_volumes(&self) -> Result<Vec<Volume>> {
        let volumes = Arc::clone(&self.collaborators.volumes);
        blocking(move || volumes.list()).await
    }

    pub fn check_permission(&self, path: &Path) -> PermissionCheck {
        self.collaborators.probe.check(path)
    }

    /// `(target, operation)` for every claimed target
    pub fn busy_targets(&self) -> Vec<(String, String)> {
        self.locks.busy()
    }

    pub fn has_running(&self) -> bool {
        !self.running.is_empty()
    }

    /// Cancel every run and wait up to `grace` for them to clean up.
    pub async fn shutdown(&self, grace: Duration) {
        self.shutdown.cancel();
        let deadline = tokio::time::Instant::now() + grace;
        while self.has_running() {
            if tokio::time::Instant::now() >= deadline {
                warn!("{} backup(s) still running at shutdown", self.running.len());
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}
