//! Per-target exclusive ownership.
//!
//! A target serves one backup, restore or delete at a time. Verification
//! only reads, so it never takes a lock.

use crate::utils::errors::{Result, SuiteError};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

#[derive(Clone, Default)]
pub struct TargetLocks {
    held: Arc<DashMap<PathBuf, String>>,
}

impl TargetLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take `target` for `operation`, or fail with `TargetBusy` without
    /// touching anything.
    pub fn try_acquire(&self, target: &Path, operation: &str) -> Result<TargetGuard> {
        let key = target_key(target);
        match self.held.entry(key.clone()) {
            Entry::Occupied(held) => Err(SuiteError::TargetBusy {
                target: target.to_path_buf(),
                operation: held.get().clone(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(operation.to_string());
                debug!("Locked {} for {}", key.display(), operation);
                Ok(TargetGuard {
                    held: Arc::clone(&self.held),
                    key,
                })
            }
        }
    }

    /// `(target, operation)` pairs currently held, sorted by target.
    pub fn busy(&self) -> Vec<(String, String)> {
        let mut busy: Vec<(String, String)> = self
            .held
            .iter()
            .map(|e| (e.key().display().to_string(), e.value().clone()))
            .collect();
        busy.sort();
        busy
    }
}

/// Releases its target when dropped
#[derive(Debug)]
pub struct TargetGuard {
    held: Arc<DashMap<PathBuf, String>>,
    key: PathBuf,
}

impl Drop for TargetGuard {
    fn drop(&mut self) {
        self.held.remove(&self.key);
        debug!("Unlocked {}", self.key.display());
    }
}

/// Same directory, same key, however it was spelled.
pub(crate) fn target_key(target: &Path) -> PathBuf {
    target
        .canonicalize()
        .unwrap_or_else(|_| target.components().collect())
}
