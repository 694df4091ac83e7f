//! Restore engine.
//!
//! Filesystem entries are unpacked back to their (possibly remapped)
//! location. Special entries are rebuilt through the tool collaborators:
//! packages reinstalled, app store apps and editor extensions installed,
//! browser files put back into the home directory.

use crate::codec::{archive_root_name, unpack, UnpackOptions};
use crate::collector::{BREWFILE, EXTENSIONS_FILE, PACKAGE_CACHE_DIR, STORE_APPS_FILE};
use crate::config::Config;
use crate::executor::pool::{blocking, run_bounded, TaskFailure, TaskOutcome};
use crate::fs::{copy_tree, make_owner_writable, remove_tree};
use crate::manifest::{ArchiveEntry, BackupManifest, SourceKind};
use crate::tools::brewfile::parse_mas_line;
use crate::tools::{Brewfile, InstallOutcome, Package, Toolchain};
use crate::utils::errors::{Result, SuiteError};
use crate::utils::format::span_percent;
use crate::verify::is_plain_file_name;
use crate::ws::Reporter;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestoreRequest {
    /// Logical paths from the manifest
    pub items: Vec<String>,
    #[serde(default)]
    pub overwrite: bool,
    /// Restore filesystem items into `<root>/<name>` instead of their origin
    #[serde(default)]
    pub destination_root: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RestoreResult {
    pub restored_count: usize,
    pub skipped_count: usize,
    pub error_count: usize,
    pub restored: Vec<String>,
    pub skipped: Vec<String>,
    /// `"<path>: <message>"` per failed item
    pub errors: Vec<String>,
}

impl RestoreResult {
    fn record(&mut self, path: &str, outcome: Result<ItemOutcome>) {
        match outcome {
            Ok(ItemOutcome::Restored) => {
                self.restored_count += 1;
                self.restored.push(path.to_string());
            }
            Ok(ItemOutcome::Skipped) => {
                self.skipped_count += 1;
                self.skipped.push(path.to_string());
            }
            Err(e) => {
                self.error_count += 1;
                self.errors.push(format!("{}: {}", path, e));
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemOutcome {
    Restored,
    Skipped,
}

/// Where a filesystem entry recorded as `path` goes back to.
///
/// `~` paths and relative paths resolve against `current_home`; absolute
/// paths under `recorded_home` are re-rooted onto `current_home`; other
/// absolute paths restore in place. `destination_root` overrides all of it.
pub fn resolve_destination(
    path: &str,
    recorded_home: &str,
    current_home: &Path,
    destination_root: Option<&Path>,
) -> PathBuf {
    if let Some(root) = destination_root {
        return root.join(archive_root_name(Path::new(path.trim_end_matches('/'))));
    }

    if path == "~" {
        return current_home.to_path_buf();
    }
    if let Some(rest) = path.strip_prefix("~/") {
        return current_home.join(rest);
    }

    let original = Path::new(path);
    if original.is_relative() {
        return current_home.join(original);
    }
    if !recorded_home.is_empty() {
        if let Ok(rest) = original.strip_prefix(recorded_home) {
            return current_home.join(rest);
        }
    }
    original.to_path_buf()
}

/// Scratch directory removed on drop
struct Scratch(PathBuf);

impl Scratch {
    fn new(parent: &Path) -> Result<Self> {
        let path = parent.join(format!(".backup-suite-restore-{}", Uuid::new_v4()));
        fs::create_dir_all(&path)?;
        Ok(Self(path))
    }

    fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        if let Err(e) = remove_tree(&self.0) {
            debug!("Scratch {} not removed: {}", self.0.display(), e);
        }
    }
}

pub struct RestoreEngine {
    config: Arc<Config>,
    tools: Toolchain,
    home: PathBuf,
    reporter: Reporter,
}

impl RestoreEngine {
    pub fn new(config: Arc<Config>, tools: Toolchain, home: PathBuf, reporter: Reporter) -> Self {
        Self {
            config,
            tools,
            home,
            reporter,
        }
    }

    /// Restore the selected items of one backup. Items are independent: a
    /// failure is recorded against its path and the rest carry on.
    pub async fn restore(
        &self,
        backup_dir: &Path,
        manifest: &BackupManifest,
        request: &RestoreRequest,
    ) -> RestoreResult {
        let mut result = RestoreResult::default();
        let total = request.items.len();
        self.reporter.progress(0.0, format!("Restoring {} item(s)", total));

        for (index, path) in request.items.iter().enumerate() {
            self.reporter.progress(
                span_percent(0.0, 100.0, index, total),
                format!("Restoring {}", path),
            );

            let outcome = match manifest.entry(path) {
                Some(entry) => self.restore_entry(backup_dir, manifest, entry, request).await,
                None => Err(SuiteError::NotFound(format!(
                    "{} is not part of backup {}",
                    path, manifest.timestamp
                ))),
            };
            match &outcome {
                Ok(ItemOutcome::Restored) => self.reporter.info(format!("Restored {}", path)),
                Ok(ItemOutcome::Skipped) => {
                    self.reporter.info(format!("Skipped {}: destination exists", path))
                }
                Err(e) => self.reporter.error(format!("Failed to restore {}: {}", path, e)),
            }
            result.record(path, outcome);
        }

        self.reporter.progress(
            100.0,
            format!(
                "Restore finished: {} restored, {} skipped, {} failed",
                result.restored_count, result.skipped_count, result.error_count
            ),
        );
        result
    }

    async fn restore_entry(
        &self,
        backup_dir: &Path,
        manifest: &BackupManifest,
        entry: &ArchiveEntry,
        request: &RestoreRequest,
    ) -> Result<ItemOutcome> {
        if !is_plain_file_name(&entry.archive) {
            return Err(SuiteError::InvalidInput(format!(
                "archive name {:?} is not a plain file name",
                entry.archive
            )));
        }
        let archive = backup_dir.join(&entry.archive);
        if !archive.is_file() {
            return Err(SuiteError::NotFound(format!(
                "archive {} is missing",
                archive.display()
            )));
        }

        match entry.kind {
            SourceKind::FilesystemPath => {
                let destination = resolve_destination(
                    &entry.path,
                    &manifest.home_dir,
                    &self.home,
                    request.destination_root.as_deref(),
                );
                restore_path(archive, destination, request.overwrite).await
            }
            SourceKind::PackageInventory => self.restore_packages(&archive, request.overwrite).await,
            SourceKind::AppInventory => self.restore_store_apps(&archive).await,
            SourceKind::ExtensionInventory => {
                self.restore_extensions(&archive, request.overwrite).await
            }
            SourceKind::BrowserSettings => {
                let home = self.home.clone();
                let options = UnpackOptions {
                    overwrite: request.overwrite,
                    strip_components: 1,
                };
                let outcome = blocking(move || unpack(&archive, &home, options)).await?;
                self.reporter.info(format!(
                    "Browser settings: {} file(s) written, {} kept",
                    outcome.written, outcome.skipped
                ));
                Ok(ItemOutcome::Restored)
            }
        }
    }

    /// Unpack a special archive into a scratch directory and hand back the
    /// staged tree for `kind`.
    async fn unpack_special(&self, archive: &Path, kind: SourceKind) -> Result<(Scratch, PathBuf)> {
        let scratch = Scratch::new(&std::env::temp_dir())?;
        let dest = scratch.path().to_path_buf();
        let archive = archive.to_path_buf();
        blocking(move || unpack(&archive, &dest, UnpackOptions { overwrite: true, strip_components: 0 }))
            .await?;
        let staged = scratch.path().join(kind.logical_key().unwrap_or_default());
        Ok((scratch, staged))
    }

    /// Reinstall only the configured essential formulae and casks that the
    /// backup's package inventory lists. Taps, the cache and everything else
    /// are left alone.
    pub async fn quick_restore(&self, backup_dir: &Path, manifest: &BackupManifest) -> Result<RestoreResult> {
        let entry = manifest
            .entries
            .iter()
            .find(|e| e.kind == SourceKind::PackageInventory)
            .ok_or_else(|| {
                SuiteError::NotFound(format!(
                    "backup {} has no package inventory",
                    manifest.timestamp
                ))
            })?;
        if !is_plain_file_name(&entry.archive) {
            return Err(SuiteError::InvalidInput(format!(
                "archive name {:?} is not a plain file name",
                entry.archive
            )));
        }
        let packages = Arc::clone(&self.tools.packages);
        if !packages.is_available().await {
            return Err(SuiteError::tool("brew", "Homebrew is not installed"));
        }

        self.reporter.progress(0.0, "Quick restore: reading package inventory");
        let (_scratch, staged) = self
            .unpack_special(&backup_dir.join(&entry.archive), SourceKind::PackageInventory)
            .await?;
        let brewfile = Brewfile::parse(&fs::read_to_string(staged.join(BREWFILE))?);

        let essentials = &self.config.restore;
        let inputs: Vec<(String, Package)> = brewfile
            .formulae
            .iter()
            .filter(|p| is_essential(&p.name, &essentials.essential_formulae))
            .chain(
                brewfile
                    .casks
                    .iter()
                    .filter(|p| is_essential(&p.name, &essentials.essential_casks)),
            )
            .map(|p| (p.label(), p.clone()))
            .collect();
        self.reporter.info(format!(
            "Quick restore: {} essential package(s) in this backup",
            inputs.len()
        ));

        let outcomes = run_bounded(
            inputs,
            self.config.performance.package_install_workers,
            &CancellationToken::new(),
            |package| {
                let packages = Arc::clone(&packages);
                async move { packages.install(&package, false).await }
            },
        )
        .await;

        let mut result = RestoreResult::default();
        for outcome in outcomes {
            let recorded = match outcome.result {
                Ok(InstallOutcome::Installed) => Ok(ItemOutcome::Restored),
                Ok(InstallOutcome::AlreadyPresent) => Ok(ItemOutcome::Skipped),
                Err(TaskFailure::Error(e)) => Err(e),
                Err(other) => Err(SuiteError::Failed {
                    message: other.to_string(),
                    paths: vec![outcome.key.clone()],
                }),
            };
            result.record(&outcome.key, recorded);
        }
        self.reporter.progress(
            100.0,
            format!(
                "Quick restore finished: {} installed, {} already present, {} failed",
                result.restored_count, result.skipped_count, result.error_count
            ),
        );
        Ok(result)
    }

    async fn restore_packages(&self, archive: &Path, force: bool) -> Result<ItemOutcome> {
        let packages = Arc::clone(&self.tools.packages);
        if !packages.is_available().await {
            return Err(SuiteError::tool("brew", "Homebrew is not installed"));
        }

        let (_scratch, staged) = self.unpack_special(archive, SourceKind::PackageInventory).await?;
        let text = fs::read_to_string(staged.join(BREWFILE))?;
        let brewfile = Brewfile::parse(&text);

        let cache = staged.join(PACKAGE_CACHE_DIR);
        if cache.is_dir() {
            match packages.cache_dir().await {
                Ok(dest) => {
                    match blocking(move || copy_tree(&cache, &dest, false).map_err(SuiteError::from)).await {
                        Ok(bytes) => self.reporter.info(format!("Restored {} bytes of package cache", bytes)),
                        Err(e) => self.reporter.warn(format!("Package cache not restored: {}", e)),
                    }
                }
                Err(e) => self.reporter.warn(format!("Package cache directory unknown: {}", e)),
            }
        }

        let mut failed = Vec::new();
        for tap in &brewfile.taps {
            match packages.install(tap, false).await {
                Ok(_) => self.reporter.info(format!("Added {}", tap.label())),
                Err(e) => {
                    self.reporter.warn(format!("Could not add {}: {}", tap.label(), e));
                    failed.push(tap.label());
                }
            }
        }

        let inputs: Vec<(String, Package)> = brewfile
            .formulae
            .iter()
            .chain(&brewfile.casks)
            .map(|p| (p.label(), p.clone()))
            .collect();
        let outcomes = run_bounded(
            inputs,
            self.config.performance.package_install_workers,
            &CancellationToken::new(),
            |package| {
                let packages = Arc::clone(&packages);
                async move { packages.install(&package, force).await }
            },
        )
        .await;
        failed.extend(self.summarize("package", outcomes));

        if failed.is_empty() {
            Ok(ItemOutcome::Restored)
        } else {
            Err(SuiteError::Failed {
                message: format!("{} package(s) failed to install", failed.len()),
                paths: failed,
            })
        }
    }

    async fn restore_store_apps(&self, archive: &Path) -> Result<ItemOutcome> {
        let app_store = Arc::clone(&self.tools.app_store);
        if !app_store.is_available().await {
            return Err(SuiteError::tool("mas", "mas is not installed"));
        }

        let (_scratch, staged) = self.unpack_special(archive, SourceKind::AppInventory).await?;
        let text = fs::read_to_string(staged.join(STORE_APPS_FILE))?;
        let installed: HashSet<String> = app_store.installed().await?.into_iter().map(|a| a.id).collect();

        let mut inputs = Vec::new();
        for app in text.lines().filter_map(parse_mas_line) {
            if installed.contains(&app.id) {
                self.reporter.info(format!("{} is already installed", app.name));
            } else {
                inputs.push((app.name.clone(), app.id));
            }
        }

        let outcomes = run_bounded(
            inputs,
            self.config.performance.package_install_workers,
            &CancellationToken::new(),
            |id| {
                let app_store = Arc::clone(&app_store);
                async move { app_store.install(&id).await }
            },
        )
        .await;
        let failed = self.summarize("app", outcomes);

        if failed.is_empty() {
            Ok(ItemOutcome::Restored)
        } else {
            Err(SuiteError::Failed {
                message: format!("{} app(s) failed to install", failed.len()),
                paths: failed,
            })
        }
    }

    async fn restore_extensions(&self, archive: &Path, overwrite: bool) -> Result<ItemOutcome> {
        let editor = Arc::clone(&self.tools.extensions);
        if !editor.is_available().await {
            return Err(SuiteError::tool("code", "editor CLI is not installed"));
        }

        let (_scratch, staged) = self.unpack_special(archive, SourceKind::ExtensionInventory).await?;
        let text = fs::read_to_string(staged.join(EXTENSIONS_FILE))?;
        let present: HashSet<String> = if overwrite {
            HashSet::new()
        } else {
            editor.list().await?.into_iter().map(|e| e.to_lowercase()).collect()
        };

        let inputs: Vec<(String, String)> = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !present.contains(&l.to_lowercase()))
            .map(|l| (l.to_string(), l.to_string()))
            .collect();
        if inputs.is_empty() {
            self.reporter.info("All extensions already installed");
        }

        let outcomes = run_bounded(
            inputs,
            self.config.performance.extension_install_workers,
            &CancellationToken::new(),
            |extension| {
                let editor = Arc::clone(&editor);
                async move { editor.install(&extension, overwrite).await }
            },
        )
        .await;
        let failed = self.summarize("extension", outcomes);

        if failed.is_empty() {
            Ok(ItemOutcome::Restored)
        } else {
            Err(SuiteError::Failed {
                message: format!("{} extension(s) failed to install", failed.len()),
                paths: failed,
            })
        }
    }

    /// Log every install outcome and return the keys that failed.
    fn summarize(&self, what: &str, outcomes: Vec<TaskOutcome<String, InstallOutcome>>) -> Vec<String> {
        let mut installed = 0;
        let mut present = 0;
        let mut failed = Vec::new();
        for outcome in outcomes {
            match outcome.result {
                Ok(InstallOutcome::Installed) => installed += 1,
                Ok(InstallOutcome::AlreadyPresent) => present += 1,
                Err(e) => {
                    let reason = match e {
                        TaskFailure::Error(e) => e.to_string(),
                        other => other.to_string(),
                    };
                    self.reporter.warn(format!("Failed to install {}: {}", outcome.key, reason));
                    failed.push(outcome.key);
                }
            }
        }
        self.reporter.info(format!(
            "{}s: {} installed, {} already present, {} failed",
            what,
            installed,
            present,
            failed.len()
        ));
        failed
    }
}

/// Tap-qualified names (`user/tap/fd`) match on their last segment.
fn is_essential(name: &str, essentials: &[String]) -> bool {
    let short = name.rsplit('/').next().unwrap_or(name);
    essentials.iter().any(|e| e == name || e == short)
}

/// Unpack one filesystem archive so its root lands at `destination`.
///
/// The archive root is named after the original source, which may differ
/// from the destination name, so it is unpacked into a scratch directory
/// beside the destination and then moved or merged into place.
async fn restore_path(archive: PathBuf, destination: PathBuf, overwrite: bool) -> Result<ItemOutcome> {
    if !overwrite && fs::symlink_metadata(&destination).is_ok() {
        return Ok(ItemOutcome::Skipped);
    }

    blocking(move || {
        let parent = match destination.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => {
                return Err(SuiteError::InvalidInput(format!(
                    "cannot restore to {}",
                    destination.display()
                )))
            }
        };
        fs::create_dir_all(&parent)?;

        let scratch = Scratch::new(&parent)?;
        let options = UnpackOptions {
            overwrite: true,
            strip_components: 0,
        };
        unpack(&archive, scratch.path(), options)?;

        let root = match fs::read_dir(scratch.path())?.flatten().next() {
            Some(root) => root.path(),
            None => {
                return Err(SuiteError::CorruptArchive {
                    path: archive.clone(),
                    message: "archive is empty".to_string(),
                })
            }
        };

        if fs::symlink_metadata(&destination).is_err() {
            move_into_place(&root, &destination)?;
        } else if root.is_dir() {
            copy_tree(&root, &destination, true)?;
        } else {
            if destination.is_dir() {
                fs::remove_dir_all(&destination)?;
            }
            fs::copy(&root, &destination)?;
        }
        Ok(ItemOutcome::Restored)
    })
    .await
}

/// Rename `from` to `to`. Moving a directory across parents rewrites its
/// `..` entry, so a read-only directory is unlocked for the move and gets
/// its mode back afterwards.
fn move_into_place(from: &Path, to: &Path) -> Result<()> {
    let metadata = fs::symlink_metadata(from)?;
    if !metadata.is_dir() {
        fs::rename(from, to)?;
        return Ok(());
    }

    let permissions = metadata.permissions();
    make_owner_writable(from, permissions.clone())?;
    fs::rename(from, to)?;
    fs::set_permissions(to, permissions)?;
    Ok(())
}
