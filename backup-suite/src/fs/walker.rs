//! Size estimation for backup sources.
//!
//! Sizes computed here are hints for progress reporting and cache ceilings;
//! the codec reports the authoritative byte counts.

use std::fs;
use std::io;
use std::path::Path;
use tracing::debug;
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// Follow symbolic links
    pub follow_links: bool,

    /// File names (exact match) pruned from the walk
    pub exclude_patterns: Vec<String>,
}

impl WalkOptions {
    pub fn excluding(patterns: &[String]) -> Self {
        Self {
            follow_links: false,
            exclude_patterns: patterns.to_vec(),
        }
    }
}

/// Total size of the regular files below `root` (or of `root` itself if it is a file).
///
/// Unreadable subtrees are skipped rather than failing the estimate; only an
/// unreadable `root` is an error.
pub fn source_size(root: &Path, options: &WalkOptions) -> io::Result<u64> {
    let metadata = fs::symlink_metadata(root)?;
    if !metadata.is_dir() {
        return Ok(if metadata.is_file() { metadata.len() } else { 0 });
    }

    let mut total = 0u64;
    let walker = WalkDir::new(root)
        .follow_links(options.follow_links)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !should_exclude(e, &options.exclude_patterns));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.depth() == 0 => return Err(e.into()),
            Err(e) => {
                debug!("Skipping during size walk: {}", e);
                continue;
            }
        };

        if entry.file_type().is_file() {
            if let Ok(metadata) = entry.metadata() {
                total += metadata.len();
            }
        }
    }

    Ok(total)
}

fn should_exclude(entry: &DirEntry, patterns: &[String]) -> bool {
    let file_name = entry.file_name().to_string_lossy();
    patterns.iter().any(|p| file_name == p.as_str())
}
