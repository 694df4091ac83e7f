//! Catalog of completed backups on a target.

use crate::manifest::{
    is_valid_timestamp, read_latest, read_manifest, write_latest, BackupManifest, SuiteLayout,
    MANUAL_APPS_FILE,
};
use crate::utils::errors::{Result, SuiteError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Prefix of a backup directory that is being deleted
const TOMBSTONE_PREFIX: &str = ".deleting-";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupSummary {
    pub timestamp: String,
    pub hash_verified: bool,
}

/// Backups with a readable manifest, newest first. A target that never held
/// a backup simply has none.
pub fn list_backups(target: &Path) -> Result<Vec<BackupSummary>> {
    let layout = SuiteLayout::new(target);
    let data_dir = layout.data_dir();
    let entries = match fs::read_dir(&data_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut backups = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with(TOMBSTONE_PREFIX) {
            sweep_tombstone(&entry.path());
            continue;
        }
        if name.starts_with('.') || !is_valid_timestamp(&name) {
            continue;
        }
        match read_manifest(&layout.manifest_path(&name)) {
            Ok(manifest) => backups.push(BackupSummary {
                timestamp: name,
                hash_verified: manifest.hash_verified,
            }),
            Err(e) => debug!("Skipping {}: {}", name, e),
        }
    }

    backups.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    Ok(backups)
}

/// Directory of an existing backup. Malformed timestamps never reach the
/// filesystem.
pub fn backup_dir(target: &Path, timestamp: &str) -> Result<PathBuf> {
    if !is_valid_timestamp(timestamp) {
        return Err(not_found(timestamp));
    }
    let layout = SuiteLayout::new(target);
    let dir = layout.backup_dir(timestamp);
    if layout.manifest_path(timestamp).is_file() {
        Ok(dir)
    } else {
        Err(not_found(timestamp))
    }
}

pub fn get_manifest(target: &Path, timestamp: &str) -> Result<BackupManifest> {
    let dir = backup_dir(target, timestamp)?;
    read_manifest(&dir.join(crate::manifest::MANIFEST_FILE))
}

/// Remove a backup as one logical step.
///
/// The directory is renamed to a hidden tombstone first, so a crash part way
/// through never leaves a half-deleted backup visible.
pub fn delete_backup(target: &Path, timestamp: &str) -> Result<()> {
    let dir = backup_dir(target, timestamp)?;
    let layout = SuiteLayout::new(target);

    let tombstone = layout
        .data_dir()
        .join(format!("{}{}-{}", TOMBSTONE_PREFIX, timestamp, Uuid::new_v4()));
    match fs::rename(&dir, &tombstone) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(not_found(timestamp)),
        Err(e) => return Err(e.into()),
    }
    fs::remove_dir_all(&tombstone)?;
    info!("Deleted backup {} from {}", timestamp, target.display());

    repoint_latest(target, &layout, timestamp)?;
    Ok(())
}

/// Manually installed apps recorded with a backup.
pub fn manual_apps(target: &Path, timestamp: &str) -> Result<Vec<String>> {
    let dir = backup_dir(target, timestamp)?;
    match fs::read_to_string(dir.join(MANUAL_APPS_FILE)) {
        Ok(text) => Ok(text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

/// `latest.json` follows the newest remaining backup after a delete.
fn repoint_latest(target: &Path, layout: &SuiteLayout, deleted: &str) -> Result<()> {
    let points_at_deleted = read_latest(layout).map_or(true, |p| p.latest == deleted);
    if !points_at_deleted {
        return Ok(());
    }

    match list_backups(target)?.first() {
        Some(newest) => write_latest(layout, &newest.timestamp),
        None => match fs::remove_file(layout.latest_path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        },
    }
}

fn sweep_tombstone(path: &Path) {
    match fs::remove_dir_all(path) {
        Ok(()) => info!("Removed leftover {}", path.display()),
        Err(e) => warn!("Could not remove leftover {}: {}", path.display(), e),
    }
}

fn not_found(timestamp: &str) -> SuiteError {
    SuiteError::NotFound(format!("backup {}", timestamp))
}
