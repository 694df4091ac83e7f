//! Filesystem helpers: size estimation, permission probing, volume discovery.

pub mod permissions;
pub mod volumes;
pub mod walker;

pub use permissions::{FsPermissionProbe, PermissionCheck, PermissionProbe};
pub use volumes::{MountedVolumes, Volume, VolumeEnumerator};
pub use walker::{source_size, WalkOptions};

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Resolve a source argument: `~` and relative paths are taken from
/// `home`, absolute paths are used as given. Restore maps paths back the
/// same way.
pub fn expand_home(path: &str, home: &Path) -> PathBuf {
    if path == "~" {
        home.to_path_buf()
    } else if let Some(rest) = path.strip_prefix("~/") {
        home.join(rest)
    } else {
        home.join(path)
    }
}

/// Copy the tree at `src` to `dest`; returns bytes copied.
///
/// Symlinks are recreated, not followed. Existing files are replaced only
/// when `overwrite` is set.
pub fn copy_tree(src: &Path, dest: &Path, overwrite: bool) -> io::Result<u64> {
    let mut copied = 0u64;

    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(io::Error::from)?;
        let relative = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let target = dest.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        if fs::symlink_metadata(&target).is_ok() {
            if !overwrite {
                continue;
            }
            fs::remove_file(&target)?;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        if file_type.is_symlink() {
            #[cfg(unix)]
            std::os::unix::fs::symlink(fs::read_link(entry.path())?, &target)?;
        } else if file_type.is_file() {
            copied += fs::copy(entry.path(), &target)?;
        }
    }

    Ok(copied)
}

/// Remove the tree at `path`, unlocking read-only directories on the way
/// when a plain removal is refused.
pub fn remove_tree(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            for entry in WalkDir::new(path).follow_links(false).into_iter().flatten() {
                if entry.file_type().is_dir() {
                    let permissions = entry.metadata().map_err(io::Error::from)?.permissions();
                    make_owner_writable(entry.path(), permissions)?;
                }
            }
            fs::remove_dir_all(path)
        }
        other => other,
    }
}

/// Permission bits of `permissions`, or `fallback` where the platform has none.
#[cfg(unix)]
pub(crate) fn permission_bits(permissions: &fs::Permissions, _fallback: u32) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    permissions.mode() & 0o7777
}

#[cfg(not(unix))]
pub(crate) fn permission_bits(_permissions: &fs::Permissions, fallback: u32) -> u32 {
    fallback
}

/// Grant the owner rwx on a directory so entries can be created inside it.
#[cfg(unix)]
pub(crate) fn make_owner_writable(path: &Path, permissions: fs::Permissions) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mode = permissions.mode();
    if mode & 0o700 != 0o700 {
        fs::set_permissions(path, fs::Permissions::from_mode(mode | 0o700))?;
    }
    Ok(())
}

#[cfg(not(unix))]
pub(crate) fn make_owner_writable(path: &Path, mut permissions: fs::Permissions) -> io::Result<()> {
    if permissions.readonly() {
        permissions.set_readonly(false);
        fs::set_permissions(path, permissions)?;
    }
    Ok(())
}

#[cfg(unix)]
pub(crate) fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
pub(crate) fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}
