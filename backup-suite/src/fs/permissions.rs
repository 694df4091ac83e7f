//! Read-permission probing.
//!
//! On macOS protected folders (Desktop, Documents, Mail, Safari) stay
//! unreadable until the user grants Full Disk Access, so every source is
//! probed before it is archived.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionCheck {
    pub path: String,
    pub readable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Answers whether a path can be read by this process
pub trait PermissionProbe: Send + Sync {
    fn check(&self, path: &Path) -> PermissionCheck;
}

/// Probe that actually opens the path
#[derive(Debug, Clone, Copy, Default)]
pub struct FsPermissionProbe;

impl PermissionProbe for FsPermissionProbe {
    fn check(&self, path: &Path) -> PermissionCheck {
        let result = match fs::metadata(path) {
            Ok(metadata) if metadata.is_dir() => fs::read_dir(path).map(|_| ()),
            Ok(_) => fs::File::open(path).map(|_| ()),
            Err(e) => Err(e),
        };

        PermissionCheck {
            path: path.display().to_string(),
            readable: result.is_ok(),
            error_message: result.err().map(|e| e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_readable_dir_and_file() -> std::io::Result<()> {
        let temp = TempDir::new()?;
        let file = temp.path().join("f.txt");
        fs::write(&file, b"x")?;

        let probe = FsPermissionProbe;
        assert!(probe.check(temp.path()).readable);
        let check = probe.check(&file);
        assert!(check.readable);
        assert!(check.error_message.is_none());
        Ok(())
    }

    #[test]
    fn test_missing_path() {
        let check = FsPermissionProbe.check(Path::new("/nonexistent_path_12345"));
        assert!(!check.readable);
        assert!(check.error_message.is_some());
    }
}
