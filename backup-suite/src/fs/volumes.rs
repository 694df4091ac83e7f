//! Mounted volume discovery.

use crate::config::VolumesConfig;
use crate::utils::errors::Result;
use nix::sys::statvfs::{statvfs, FsFlags};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Marker files identifying Time Machine destinations
const TIME_MACHINE_MARKERS: [&str; 3] = [
    ".timemachine",
    "Backups.backupdb",
    ".com.apple.timemachine.supported",
];

/// A candidate backup target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    pub name: String,
    pub path: String,
    pub available: bool,
    pub writable: bool,
    pub is_internal: bool,
    pub free_space_gb: f64,
}

pub trait VolumeEnumerator: Send + Sync {
    fn list(&self) -> Result<Vec<Volume>>;
}

/// Lists the writable, non-Time-Machine children of the volumes directory
#[derive(Debug, Clone)]
pub struct MountedVolumes {
    root: PathBuf,
    excluded: Vec<String>,
}

impl MountedVolumes {
    pub fn new(config: &VolumesConfig) -> Self {
        Self {
            root: config.root.clone(),
            excluded: config.excluded.clone(),
        }
    }
}

impl VolumeEnumerator for MountedVolumes {
    fn list(&self) -> Result<Vec<Volume>> {
        let mut volumes = Vec::new();

        for entry in fs::read_dir(&self.root)?.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }

            let name = entry.file_name().to_string_lossy().to_string();
            if self.excluded.iter().any(|e| *e == name) {
                continue;
            }
            if is_time_machine_volume(&path) {
                debug!("Skipping Time Machine volume {}", name);
                continue;
            }

            let (writable, free_space_gb) = probe_filesystem(&path);
            if !writable {
                continue;
            }

            volumes.push(Volume {
                available: fs::read_dir(&path).is_ok(),
                writable,
                is_internal: is_internal_volume(&name),
                free_space_gb,
                path: path.display().to_string(),
                name,
            });
        }

        volumes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(volumes)
    }
}

fn is_time_machine_volume(path: &Path) -> bool {
    TIME_MACHINE_MARKERS.iter().any(|m| path.join(m).exists())
}

fn is_internal_volume(name: &str) -> bool {
    name.starts_with("com.apple") || matches!(name, "Recovery" | "Preboot" | "VM" | "Update")
}

/// (writable, free space in GiB) from statvfs; an unprobeable mount counts as read-only.
fn probe_filesystem(path: &Path) -> (bool, f64) {
    match statvfs(path) {
        Ok(stat) => {
            let free_bytes = stat.blocks_available() as u64 * stat.fragment_size() as u64;
            (
                !stat.flags().contains(FsFlags::ST_RDONLY),
                free_bytes as f64 / BYTES_PER_GB,
            )
        }
        Err(e) => {
            debug!("statvfs failed for {}: {}", path.display(), e);
            (false, 0.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lists_candidate_volumes() -> Result<()> {
        let temp = TempDir::new()?;
        fs::create_dir(temp.path().join("Backup Disk"))?;
        fs::create_dir(temp.path().join("Macintosh HD"))?;
        fs::create_dir_all(temp.path().join("TM Disk/Backups.backupdb"))?;
        fs::create_dir(temp.path().join("Recovery"))?;
        fs::write(temp.path().join("not-a-volume"), b"")?;

        let enumerator = MountedVolumes::new(&VolumesConfig {
            root: temp.path().to_path_buf(),
            excluded: vec!["Macintosh HD".to_string()],
        });
        let volumes = enumerator.list()?;

        let names: Vec<&str> = volumes.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["Backup Disk", "Recovery"]);
        assert!(!volumes[0].is_internal);
        assert!(volumes[1].is_internal);
        assert!(volumes.iter().all(|v| v.available && v.writable));
        Ok(())
    }

    #[test]
    fn test_internal_names() {
        assert!(is_internal_volume("com.apple.TimeMachine.localsnapshots"));
        assert!(is_internal_volume("Preboot"));
        assert!(!is_internal_volume("External SSD"));
    }
}
