//! Manifest store.
//!
//! Every completed backup lives in `<target>/backup-suite/data/<timestamp>/`
//! next to a `manifest.json` describing its archives. The manifest is written
//! once, atomically, after every archive succeeded; the only later mutation is
//! flipping `hash_verified`.

use crate::utils::errors::{Result, SuiteError};
use chrono::{DateTime, Duration, Local};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

pub const FORMAT_VERSION: u32 = 1;
pub const HASH_ALGORITHM: &str = "sha256";

pub const SUITE_DIR: &str = "backup-suite";
pub const DATA_DIR: &str = "data";
pub const MANIFEST_FILE: &str = "manifest.json";
pub const LATEST_FILE: &str = "latest.json";
pub const MANUAL_APPS_FILE: &str = "manual_apps.txt";
pub const STAGING_DIR: &str = ".staging";
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

/// Attempts at finding a free timestamp before giving up
const MAX_TIMESTAMP_ATTEMPTS: i64 = 120;

/// What a backup item is, and therefore how it is collected and restored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    FilesystemPath,
    PackageInventory,
    AppInventory,
    ExtensionInventory,
    BrowserSettings,
}

impl SourceKind {
    /// Logical path recorded for special sources.
    pub fn logical_key(self) -> Option<&'static str> {
        match self {
            SourceKind::FilesystemPath => None,
            SourceKind::PackageInventory => Some("homebrew-packages"),
            SourceKind::AppInventory => Some("mas-apps"),
            SourceKind::ExtensionInventory => Some("vscode-extensions"),
            SourceKind::BrowserSettings => Some("safari-settings"),
        }
    }
}

/// One archive inside a backup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveEntry {
    /// Directory as supplied by the caller, or a special source key
    pub path: String,
    pub kind: SourceKind,
    /// Archive file name inside the backup directory
    pub archive: String,
    pub archive_size_bytes: u64,
    pub source_size_bytes: u64,
    /// sha256 of the archive file
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedSource {
    pub path: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub timestamp: String,
    pub entries: Vec<ArchiveEntry>,
    pub total_source_size_bytes: u64,
    pub total_archive_size_bytes: u64,
    pub start_time: String,
    pub end_time: String,
    pub duration_seconds: f64,
    pub hash_verified: bool,

    #[serde(default = "default_format_version")]
    pub format_version: u32,
    #[serde(default = "default_hash_algorithm")]
    pub hash_algorithm: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub home_dir: String,
    #[serde(default)]
    pub skipped_sources: Vec<SkippedSource>,
}

fn default_format_version() -> u32 {
    FORMAT_VERSION
}

fn default_hash_algorithm() -> String {
    HASH_ALGORITHM.to_string()
}

impl BackupManifest {
    /// Assemble a manifest from finished entries; totals are derived, never supplied.
    pub fn new(
        timestamp: String,
        mut entries: Vec<ArchiveEntry>,
        started: DateTime<Local>,
        finished: DateTime<Local>,
        skipped_sources: Vec<SkippedSource>,
    ) -> Self {
        // Stable: equal paths keep collection order
        entries.sort_by(|a, b| a.path.cmp(&b.path));

        let total_source_size_bytes = entries.iter().map(|e| e.source_size_bytes).sum();
        let total_archive_size_bytes = entries.iter().map(|e| e.archive_size_bytes).sum();
        let duration_seconds = (finished - started).num_milliseconds().max(0) as f64 / 1000.0;

        Self {
            timestamp,
            entries,
            total_source_size_bytes,
            total_archive_size_bytes,
            start_time: started.to_rfc3339(),
            end_time: finished.to_rfc3339(),
            duration_seconds,
            hash_verified: false,
            format_version: FORMAT_VERSION,
            hash_algorithm: HASH_ALGORITHM.to_string(),
            hostname: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_default(),
            home_dir: dirs::home_dir()
                .map(|h| h.display().to_string())
                .unwrap_or_default(),
            skipped_sources,
        }
    }

    pub fn entry(&self, path: &str) -> Option<&ArchiveEntry> {
        self.entries.iter().find(|e| e.path == path)
    }
}

/// `latest.json` contents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatestPointer {
    pub latest: String,
    pub created_at: String,
}

/// Paths of the suite tree on one target
#[derive(Debug, Clone)]
pub struct SuiteLayout {
    root: PathBuf,
}

impl SuiteLayout {
    pub fn new(target: &Path) -> Self {
        Self {
            root: target.join(SUITE_DIR),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join(DATA_DIR)
    }

    pub fn backup_dir(&self, timestamp: &str) -> PathBuf {
        self.data_dir().join(timestamp)
    }

    pub fn manifest_path(&self, timestamp: &str) -> PathBuf {
        self.backup_dir(timestamp).join(MANIFEST_FILE)
    }

    pub fn latest_path(&self) -> PathBuf {
        self.root.join(LATEST_FILE)
    }

    /// Create a fresh backup directory named after the current local time.
    ///
    /// A taken second moves the timestamp forward, so two runs started within
    /// the same second still get distinct directories.
    pub fn reserve_backup_dir(&self) -> Result<(String, PathBuf)> {
        let data_dir = self.data_dir();
        fs::create_dir_all(&data_dir)?;

        let now = Local::now();
        for offset in 0..MAX_TIMESTAMP_ATTEMPTS {
            let timestamp = (now + Duration::seconds(offset))
                .format(TIMESTAMP_FORMAT)
                .to_string();
            let dir = data_dir.join(&timestamp);
            match fs::create_dir(&dir) {
                Ok(()) => return Ok((timestamp, dir)),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Err(SuiteError::Failed {
            message: "no free backup timestamp".to_string(),
            paths: vec![data_dir.display().to_string()],
        })
    }
}

/// `YYYYMMDD-HHMMSS` and nothing else. Anything failing this never becomes a path.
pub fn is_valid_timestamp(timestamp: &str) -> bool {
    let bytes = timestamp.as_bytes();
    bytes.len() == 15
        && bytes
            .iter()
            .enumerate()
            .all(|(i, b)| if i == 8 { *b == b'-' } else { b.is_ascii_digit() })
        && chrono::NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT).is_ok()
}

/// Write JSON via temp file, fsync and rename.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");

    {
        let mut file = File::create(&tmp)?;
        file.write_all(&json)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;

    if let Some(parent) = path.parent() {
        // Persist the rename itself; not every filesystem allows syncing a directory
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }

    debug!("Wrote {}", path.display());
    Ok(())
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let data = fs::read(path)?;
    Ok(serde_json::from_slice(&data)?)
}

pub fn write_manifest(path: &Path, manifest: &BackupManifest) -> Result<()> {
    write_json_atomic(path, manifest)
}

pub fn read_manifest(path: &Path) -> Result<BackupManifest> {
    read_json(path)
}

/// Set `hash_verified` through an atomic rewrite.
pub fn mark_verified(path: &Path) -> Result<BackupManifest> {
    let mut manifest = read_manifest(path)?;
    if !manifest.hash_verified {
        manifest.hash_verified = true;
        write_manifest(path, &manifest)?;
    }
    Ok(manifest)
}

pub fn write_latest(layout: &SuiteLayout, timestamp: &str) -> Result<()> {
    let pointer = LatestPointer {
        latest: timestamp.to_string(),
        created_at: Local::now().to_rfc3339(),
    };
    write_json_atomic(&layout.latest_path(), &pointer)
}

pub fn read_latest(layout: &SuiteLayout) -> Option<LatestPointer> {
    read_json(&layout.latest_path()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(path: &str, source: u64, archive: u64) -> ArchiveEntry {
        ArchiveEntry {
            path: path.to_string(),
            kind: SourceKind::FilesystemPath,
            archive: format!("{}.tar.zst", path.trim_start_matches('/')),
            archive_size_bytes: archive,
            source_size_bytes: source,
            hash: "0".repeat(64),
        }
    }

    #[test]
    fn test_new_manifest_sorts_and_sums() {
        let started = Local::now();
        let finished = started + Duration::milliseconds(1500);
        let manifest = BackupManifest::new(
            "20240102-030405".to_string(),
            vec![entry("/b", 10, 4), entry("/a", 5, 3)],
            started,
            finished,
            Vec::new(),
        );

        assert_eq!(manifest.entries[0].path, "/a");
        assert_eq!(manifest.total_source_size_bytes, 15);
        assert_eq!(manifest.total_archive_size_bytes, 7);
        assert!((manifest.duration_seconds - 1.5).abs() < f64::EPSILON);
        assert!(!manifest.hash_verified);
        assert_eq!(manifest.hash_algorithm, "sha256");
    }

    #[test]
    fn test_write_read_and_mark_verified() -> Result<()> {
        let temp = TempDir::new()?;
        let path = temp.path().join(MANIFEST_FILE);
        let now = Local::now();
        let manifest = BackupManifest::new(
            "20240102-030405".to_string(),
            vec![entry("/a", 1, 1)],
            now,
            now,
            Vec::new(),
        );

        write_manifest(&path, &manifest)?;
        assert!(!temp.path().join("manifest.json.tmp").exists());
        assert_eq!(read_manifest(&path)?, manifest);

        let verified = mark_verified(&path)?;
        assert!(verified.hash_verified);
        assert!(read_manifest(&path)?.hash_verified);
        Ok(())
    }

    #[test]
    fn test_manifest_without_extended_fields_loads() -> Result<()> {
        let json = r#"{
            "timestamp": "20240102-030405",
            "entries": [],
            "total_source_size_bytes": 0,
            "total_archive_size_bytes": 0,
            "start_time": "2024-01-02T03:04:05+00:00",
            "end_time": "2024-01-02T03:04:05+00:00",
            "duration_seconds": 0.0,
            "hash_verified": false
        }"#;
        let manifest: BackupManifest = serde_json::from_str(json)?;
        assert_eq!(manifest.format_version, FORMAT_VERSION);
        assert!(manifest.skipped_sources.is_empty());
        Ok(())
    }

    #[test]
    fn test_timestamp_validation() {
        assert!(is_valid_timestamp("20240102-030405"));
        assert!(!is_valid_timestamp("20241302-030405"));
        assert!(!is_valid_timestamp("../../etc"));
        assert!(!is_valid_timestamp("20240102_030405"));
        assert!(!is_valid_timestamp("+2024010-030405"));
    }

    #[test]
    fn test_reserve_bumps_on_collision() -> Result<()> {
        let temp = TempDir::new()?;
        let layout = SuiteLayout::new(temp.path());

        let (first, first_dir) = layout.reserve_backup_dir()?;
        let (second, second_dir) = layout.reserve_backup_dir()?;
        assert_ne!(first, second);
        assert!(first_dir.is_dir() && second_dir.is_dir());
        assert!(is_valid_timestamp(&first) && is_valid_timestamp(&second));
        assert!(first_dir.starts_with(temp.path().join("backup-suite/data")));
        Ok(())
    }

    #[test]
    fn test_latest_pointer() -> Result<()> {
        let temp = TempDir::new()?;
        let layout = SuiteLayout::new(temp.path());
        fs::create_dir_all(layout.root())?;

        assert!(read_latest(&layout).is_none());
        write_latest(&layout, "20240102-030405")?;
        assert_eq!(
            read_latest(&layout).map(|p| p.latest),
            Some("20240102-030405".to_string())
        );
        Ok(())
    }
}
