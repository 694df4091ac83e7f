//! End-to-end engine flows against temporary directories, with every
//! external CLI replaced by an absent tool.

use async_trait::async_trait;
use backup_suite::fs::{FsPermissionProbe, Volume, VolumeEnumerator};
use backup_suite::manifest::SuiteLayout;
use backup_suite::restore::RestoreRequest;
use backup_suite::tools::{
    AppStore, ExtensionManager, InstallOutcome, Package, PackageManager, StoreApp, Toolchain,
};
use backup_suite::ws::EngineEvent;
use backup_suite::{Collaborators, Config, Engine, Result, SuiteError};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use walkdir::WalkDir;

struct Absent;

#[async_trait]
impl PackageManager for Absent {
    async fn is_available(&self) -> bool {
        false
    }
    async fn inventory(&self) -> Result<String> {
        Ok(String::new())
    }
    async fn installed_casks(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
    async fn cache_dir(&self) -> Result<PathBuf> {
        Ok(PathBuf::new())
    }
    async fn install(&self, _package: &Package, _force: bool) -> Result<InstallOutcome> {
        Ok(InstallOutcome::Installed)
    }
}

#[async_trait]
impl AppStore for Absent {
    async fn is_available(&self) -> bool {
        false
    }
    async fn installed(&self) -> Result<Vec<StoreApp>> {
        Ok(Vec::new())
    }
    async fn install(&self, _app_id: &str) -> Result<InstallOutcome> {
        Ok(InstallOutcome::Installed)
    }
}

#[async_trait]
impl ExtensionManager for Absent {
    async fn is_available(&self) -> bool {
        false
    }
    async fn list(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
    async fn install(&self, _extension: &str, _force: bool) -> Result<InstallOutcome> {
        Ok(InstallOutcome::Installed)
    }
}

impl VolumeEnumerator for Absent {
    fn list(&self) -> Result<Vec<Volume>> {
        Ok(vec![Volume {
            name: "Backup".to_string(),
            path: "/Volumes/Backup".to_string(),
            available: true,
            writable: true,
            is_internal: false,
            free_space_gb: 100.0,
        }])
    }
}

struct Fixture {
    temp: TempDir,
    engine: Engine,
}

impl Fixture {
    fn new() -> Result<Self> {
        Self::with_workers(2)
    }

    fn with_workers(workers: usize) -> Result<Self> {
        let temp = TempDir::new()?;
        fs::create_dir_all(temp.path().join("target"))?;
        fs::create_dir_all(temp.path().join("home"))?;

        let mut config = Config::default();
        config.backup.workers = workers;
        config.sources.applications_dir = temp.path().join("no-apps");

        let collaborators = Collaborators {
            tools: Toolchain {
                packages: Arc::new(Absent),
                app_store: Arc::new(Absent),
                extensions: Arc::new(Absent),
            },
            probe: Arc::new(FsPermissionProbe),
            volumes: Arc::new(Absent),
            home: temp.path().join("home"),
        };
        Ok(Self {
            engine: Engine::new(config, collaborators),
            temp,
        })
    }

    fn target(&self) -> PathBuf {
        self.temp.path().join("target")
    }

    /// Two source directories with a little nesting
    fn sources(&self) -> Result<Vec<String>> {
        let docs = self.temp.path().join("src/Documents");
        let code = self.temp.path().join("src/Code");
        fs::create_dir_all(docs.join("letters"))?;
        fs::create_dir_all(code.join("crate/src"))?;
        fs::write(docs.join("letters/one.txt"), b"dear reader")?;
        fs::write(docs.join("todo.md"), "- [ ] water plants\n".repeat(50))?;
        fs::write(code.join("crate/src/lib.rs"), b"pub fn answer() -> u32 { 42 }\n")?;
        fs::write(code.join("crate/Cargo.lock"), vec![7u8; 4096])?;
        Ok(vec![docs.display().to_string(), code.display().to_string()])
    }
}

/// Relative path -> contents for every file below `root`
fn snapshot(root: &Path) -> Vec<(PathBuf, Vec<u8>)> {
    let mut files: Vec<(PathBuf, Vec<u8>)> = WalkDir::new(root)
        .into_iter()
        .flatten()
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            let relative = e.path().strip_prefix(root).unwrap().to_path_buf();
            (relative, fs::read(e.path()).unwrap())
        })
        .collect();
    files.sort();
    files
}

#[tokio::test]
async fn test_backup_verify_restore_round_trip() -> Result<()> {
    let fixture = Fixture::new()?;
    let directories = fixture.sources()?;
    let target = fixture.target();

    let manifest = fixture.engine.create_backup(&target, directories.clone()).await?;
    assert_eq!(manifest.entries.len(), 2);
    assert!(manifest.duration_seconds >= 0.0);
    assert_eq!(
        manifest.entries.iter().map(|e| e.source_size_bytes).sum::<u64>(),
        manifest.total_source_size_bytes
    );
    assert!(!manifest.hash_verified);

    let listed = fixture.engine.list_backups(&target).await?;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].timestamp, manifest.timestamp);
    assert!(!listed[0].hash_verified);

    let report = fixture.engine.verify_backup(&target, &manifest.timestamp).await?;
    assert!(report.success, "{:?}", report.failures);
    assert_eq!(report.verified_count, 2);
    assert!(fixture.engine.list_backups(&target).await?[0].hash_verified);

    let out = fixture.temp.path().join("restored");
    fs::create_dir_all(&out)?;
    let result = fixture
        .engine
        .restore_items(
            &target,
            &manifest.timestamp,
            RestoreRequest {
                items: directories.clone(),
                overwrite: true,
                destination_root: Some(out.clone()),
            },
        )
        .await?;
    assert_eq!(result.restored_count, 2, "{:?}", result.errors);
    assert_eq!(result.error_count, 0);

    for dir in &directories {
        let original = PathBuf::from(dir);
        let name = original.file_name().unwrap();
        assert_eq!(snapshot(&original), snapshot(&out.join(name)));
    }
    Ok(())
}

#[tokio::test]
async fn test_verify_is_repeatable_and_detects_corruption() -> Result<()> {
    let fixture = Fixture::new()?;
    let target = fixture.target();
    let manifest = fixture.engine.create_backup(&target, fixture.sources()?).await?;

    let first = fixture.engine.verify_backup(&target, &manifest.timestamp).await?;
    let second = fixture.engine.verify_backup(&target, &manifest.timestamp).await?;
    assert_eq!(first.success, second.success);
    assert_eq!(first.failed_paths, second.failed_paths);

    let victim = &manifest.entries[1];
    let archive = SuiteLayout::new(&target)
        .backup_dir(&manifest.timestamp)
        .join(&victim.archive);
    let mut bytes = fs::read(&archive)?;
    let middle = bytes.len() / 2;
    bytes[middle] ^= 0xff;
    fs::write(&archive, bytes)?;

    let report = fixture.engine.verify_backup(&target, &manifest.timestamp).await?;
    assert!(!report.success);
    assert_eq!(report.failed_paths, vec![victim.path.clone()]);
    Ok(())
}

#[tokio::test]
async fn test_cancelled_backup_leaves_nothing() -> Result<()> {
    let fixture = Fixture::new()?;
    let target = fixture.target();
    let mut events = fixture.engine.subscribe();

    let (run_id, handle) = fixture.engine.spawn_backup(&target, fixture.sources()?)?;
    assert_eq!(fixture.engine.cancel_backup(Some(&target)), 1);

    let outcome = handle.await.expect("backup task");
    assert!(matches!(outcome, Err(SuiteError::Cancelled)));
    assert!(fixture.engine.list_backups(&target).await?.is_empty());
    let data_dir = SuiteLayout::new(&target).data_dir();
    assert_eq!(fs::read_dir(&data_dir)?.count(), 0);
    assert!(!fixture.engine.has_running());

    let mut saw_cancelled = false;
    while let Ok(event) = events.try_recv() {
        if let EngineEvent::BackupCancelled { run_id: id } = event {
            assert_eq!(id, run_id);
            saw_cancelled = true;
        }
    }
    assert!(saw_cancelled);
    Ok(())
}

// One runtime thread: the test wakes on the first "Archived" event before the
// next item's pack can finish, so the cancel always lands between archives.
#[tokio::test(flavor = "current_thread")]
async fn test_cancel_after_first_archive_removes_everything() -> Result<()> {
    let fixture = Fixture::with_workers(1)?;
    let target = fixture.target();
    let mut directories = fixture.sources()?;
    let extra = fixture.temp.path().join("src/Music");
    fs::create_dir_all(&extra)?;
    fs::write(extra.join("track.flac"), vec![3u8; 256 * 1024])?;
    directories.push(extra.display().to_string());
    let mut events = fixture.engine.subscribe();

    let (_run_id, handle) = fixture.engine.spawn_backup(&target, directories)?;
    let data_dir = SuiteLayout::new(&target).data_dir();
    loop {
        match events.recv().await {
            Ok(EngineEvent::BackupProgress(p)) if p.message.starts_with("Archived ") => break,
            Ok(EngineEvent::BackupCompleted { .. }) => panic!("backup finished before it was cancelled"),
            Ok(_) => {}
            Err(e) => panic!("event stream ended: {}", e),
        }
    }

    let archives_on_disk = WalkDir::new(&data_dir)
        .into_iter()
        .flatten()
        .filter(|e| e.file_name().to_string_lossy().ends_with(".tar.zst"))
        .count();
    assert!(archives_on_disk >= 1);
    assert_eq!(fixture.engine.cancel_backup(None), 1);

    let outcome = handle.await.expect("backup task");
    assert!(matches!(outcome, Err(SuiteError::Cancelled)));
    assert_eq!(fs::read_dir(&data_dir)?.count(), 0);
    assert!(fixture.engine.list_backups(&target).await?.is_empty());
    assert!(!SuiteLayout::new(&target).root().join("latest.json").exists());
    Ok(())
}

#[tokio::test]
async fn test_busy_target_is_rejected() -> Result<()> {
    let fixture = Fixture::new()?;
    let target = fixture.target();
    let directories = fixture.sources()?;

    let (_run_id, handle) = fixture.engine.spawn_backup(&target, directories.clone())?;
    let second = fixture.engine.create_backup(&target, directories).await;
    assert!(matches!(second, Err(SuiteError::TargetBusy { .. })));
    assert_eq!(fixture.engine.busy_targets().len(), 1);

    let first = handle.await.expect("backup task")?;
    assert_eq!(fixture.engine.list_backups(&target).await?.len(), 1);
    assert_eq!(fixture.engine.list_backups(&target).await?[0].timestamp, first.timestamp);
    assert!(fixture.engine.busy_targets().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_restore_without_overwrite_skips_existing() -> Result<()> {
    let fixture = Fixture::new()?;
    let target = fixture.target();
    let directories = fixture.sources()?;
    let manifest = fixture.engine.create_backup(&target, directories.clone()).await?;

    let out = fixture.temp.path().join("restored");
    fs::create_dir_all(out.join("Code"))?;
    fs::write(out.join("Code/keep.txt"), b"mine")?;

    let result = fixture
        .engine
        .restore_items(
            &target,
            &manifest.timestamp,
            RestoreRequest {
                items: directories,
                overwrite: false,
                destination_root: Some(out.clone()),
            },
        )
        .await?;
    assert_eq!(result.restored_count, 1);
    assert_eq!(result.skipped_count, 1);
    assert_eq!(result.error_count, 0);
    assert_eq!(fs::read(out.join("Code/keep.txt"))?, b"mine");
    assert!(!out.join("Code/crate").exists());
    assert!(out.join("Documents/letters/one.txt").is_file());
    Ok(())
}

#[tokio::test]
async fn test_delete_lifecycle() -> Result<()> {
    let fixture = Fixture::new()?;
    let target = fixture.target();

    for _ in 0..2 {
        assert!(matches!(
            fixture.engine.delete_backup(&target, "20200101-000000").await,
            Err(SuiteError::NotFound(_))
        ));
    }

    let manifest = fixture.engine.create_backup(&target, fixture.sources()?).await?;
    fixture.engine.delete_backup(&target, &manifest.timestamp).await?;
    assert!(fixture.engine.list_backups(&target).await?.is_empty());
    assert!(matches!(
        fixture.engine.get_backup_details(&target, &manifest.timestamp).await,
        Err(SuiteError::NotFound(_))
    ));
    assert!(matches!(
        fixture.engine.delete_backup(&target, &manifest.timestamp).await,
        Err(SuiteError::NotFound(_))
    ));
    Ok(())
}

#[tokio::test]
async fn test_unknown_backup_is_not_found_for_readers() -> Result<()> {
    let fixture = Fixture::new()?;
    let target = fixture.target();

    for timestamp in ["20240101-120000", "../../etc"] {
        let verify = fixture.engine.verify_backup(&target, timestamp).await;
        assert!(matches!(verify, Err(SuiteError::NotFound(_))));

        let request = RestoreRequest {
            items: vec!["anything".to_string()],
            overwrite: false,
            destination_root: None,
        };
        let restore = fixture.engine.restore_items(&target, timestamp, request).await;
        assert!(matches!(restore, Err(SuiteError::NotFound(_))));

        let quick = fixture.engine.quick_restore(&target, timestamp).await;
        assert!(matches!(quick, Err(SuiteError::NotFound(_))));
    }
    assert!(fixture.engine.busy_targets().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_events_bracket_a_run() -> Result<()> {
    let fixture = Fixture::new()?;
    let target = fixture.target();
    let mut events = fixture.engine.subscribe();

    let manifest = fixture.engine.create_backup(&target, fixture.sources()?).await?;

    let mut received = Vec::new();
    while let Ok(event) = events.try_recv() {
        received.push(event);
    }
    assert!(matches!(received.first(), Some(EngineEvent::BackupStarted { .. })));
    match received.last() {
        Some(EngineEvent::BackupCompleted { timestamp, entries, .. }) => {
            assert_eq!(timestamp, &manifest.timestamp);
            assert_eq!(*entries, 2);
        }
        other => panic!("unexpected last event {:?}", other),
    }
    assert!(received
        .iter()
        .any(|e| matches!(e, EngineEvent::BackupProgress(_))));
    Ok(())
}

#[tokio::test]
async fn test_collaborator_queries() -> Result<()> {
    let fixture = Fixture::new()?;
    let volumes = fixture.engine.list_volumes().await?;
    assert_eq!(volumes[0].name, "Backup");

    let check = fixture.engine.check_permission(&fixture.temp.path().join("missing"));
    assert!(!check.readable);
    assert!(check.error_message.is_some());

    let manifest = fixture.engine.create_backup(&fixture.target(), fixture.sources()?).await?;
    let apps = fixture
        .engine
        .get_manual_apps(&fixture.target(), &manifest.timestamp)
        .await?;
    assert!(apps.is_empty());
    Ok(())
}
