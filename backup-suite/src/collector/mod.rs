//! Source collector.
//!
//! Turns the caller's directory list plus the enabled special sources into an
//! ordered list of backup items. Filesystem directories come first, in the
//! caller's order; special sources are staged as small trees under
//! `<backup_dir>/.staging/<key>/` so the codec can archive them like any
//! other directory.

pub mod manual_apps;

use crate::codec::{archive_root_name, Compression};
use crate::config::Config;
use crate::executor::pool::blocking;
use crate::fs::{copy_tree, expand_home, source_size, PermissionProbe, WalkOptions};
use crate::manifest::{SkippedSource, SourceKind, MANUAL_APPS_FILE, STAGING_DIR};
use crate::tools::{Brewfile, StoreApp, Toolchain};
use crate::utils::errors::{Result, SuiteError};
use crate::ws::Reporter;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const BREWFILE: &str = "Brewfile";
pub const PACKAGE_CACHE_DIR: &str = "cache";
pub const STORE_APPS_FILE: &str = "mas_apps.txt";
pub const EXTENSIONS_FILE: &str = "extensions.txt";

/// Share of overall backup progress spent collecting
pub const COLLECT_PERCENT: f64 = 15.0;
const DIRECTORIES_PERCENT: f64 = 10.0;

const SPECIAL_SOURCES: [SourceKind; 4] = [
    SourceKind::PackageInventory,
    SourceKind::AppInventory,
    SourceKind::ExtensionInventory,
    SourceKind::BrowserSettings,
];

/// One item to archive
#[derive(Debug, Clone, PartialEq)]
pub struct CollectedItem {
    pub logical_path: String,
    pub kind: SourceKind,
    pub source_path: PathBuf,
    pub archive_name: String,
    pub size_hint: u64,
}

#[derive(Debug, Default)]
pub struct Collection {
    pub items: Vec<CollectedItem>,
    pub skipped: Vec<SkippedSource>,
}

impl Collection {
    pub fn size_hint(&self) -> u64 {
        self.items.iter().map(|i| i.size_hint).sum()
    }
}

pub struct SourceCollector {
    config: Arc<Config>,
    tools: Toolchain,
    probe: Arc<dyn PermissionProbe>,
    home: PathBuf,
}

impl SourceCollector {
    pub fn new(
        config: Arc<Config>,
        tools: Toolchain,
        probe: Arc<dyn PermissionProbe>,
        home: PathBuf,
    ) -> Self {
        Self {
            config,
            tools,
            probe,
            home,
        }
    }

    /// Enumerate every source for one backup into `backup_dir`.
    pub async fn collect(
        &self,
        directories: &[String],
        backup_dir: &Path,
        compression: Compression,
        cancel: &CancellationToken,
        reporter: &Reporter,
    ) -> Result<Collection> {
        let mut collection = Collection::default();
        let mut names = ArchiveNames::new(compression);
        let mut seen = HashSet::new();
        let total = directories.len().max(1) as f64;

        for (index, dir) in directories.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(SuiteError::Cancelled);
            }
            reporter.progress(
                DIRECTORIES_PERCENT * index as f64 / total,
                format!("Checking {}", dir),
            );

            if !seen.insert(dir.as_str()) {
                reporter.warn(format!("Skipping duplicate source {}", dir));
                continue;
            }

            let path = expand_home(dir, &self.home);
            let check = self.probe.check(&path);
            if !check.readable {
                let reason = check
                    .error_message
                    .unwrap_or_else(|| "not readable".to_string());
                reporter.warn(format!("Skipping {}: {}", dir, reason));
                collection.skipped.push(SkippedSource {
                    path: dir.clone(),
                    reason,
                });
                continue;
            }

            let size_hint = self.size_of(&path).await;
            collection.items.push(CollectedItem {
                logical_path: dir.clone(),
                kind: SourceKind::FilesystemPath,
                archive_name: names.assign(&archive_root_name(&path)),
                source_path: path,
                size_hint,
            });
        }

        let staging = backup_dir.join(STAGING_DIR);
        let specials = SPECIAL_SOURCES.len() as f64;
        for (index, kind) in SPECIAL_SOURCES.into_iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(SuiteError::Cancelled);
            }
            let Some(key) = kind.logical_key() else {
                continue;
            };
            if !self.is_enabled(kind) {
                continue;
            }
            reporter.progress(
                DIRECTORIES_PERCENT
                    + (COLLECT_PERCENT - DIRECTORIES_PERCENT) * index as f64 / specials,
                format!("Collecting {}", key),
            );

            let dir = staging.join(key);
            let staged = match kind {
                SourceKind::PackageInventory => self.stage_packages(&dir, reporter).await,
                SourceKind::AppInventory => self.stage_store_apps(&staging, &dir, reporter).await,
                SourceKind::ExtensionInventory => self.stage_extensions(&dir, reporter).await,
                SourceKind::BrowserSettings => self.stage_browser_settings(&dir, reporter).await,
                SourceKind::FilesystemPath => Ok(false),
            };

            match staged {
                Ok(true) => {
                    let size_hint = self.size_of(&dir).await;
                    collection.items.push(CollectedItem {
                        logical_path: key.to_string(),
                        kind,
                        source_path: dir,
                        archive_name: names.assign(key),
                        size_hint,
                    });
                }
                Ok(false) => {}
                Err(e @ SuiteError::Tool { .. }) => {
                    reporter.warn(format!("Skipping {}: {}", key, e));
                    collection.skipped.push(SkippedSource {
                        path: key.to_string(),
                        reason: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }

        self.record_manual_apps(backup_dir, reporter).await;
        reporter.progress(
            COLLECT_PERCENT,
            format!("{} item(s) to archive", collection.items.len()),
        );
        Ok(collection)
    }

    fn is_enabled(&self, kind: SourceKind) -> bool {
        let sources = &self.config.sources;
        match kind {
            SourceKind::FilesystemPath => true,
            SourceKind::PackageInventory => sources.package_inventory,
            SourceKind::AppInventory => sources.app_inventory,
            SourceKind::ExtensionInventory => sources.extension_inventory,
            SourceKind::BrowserSettings => sources.browser_settings,
        }
    }

    async fn size_of(&self, path: &Path) -> u64 {
        let path = path.to_path_buf();
        let options = WalkOptions::excluding(&self.config.backup.exclude_patterns);
        match blocking(move || source_size(&path, &options).map_err(SuiteError::from)).await {
            Ok(size) => size,
            Err(e) => {
                debug!("Size estimate failed: {}", e);
                0
            }
        }
    }

    async fn stage_packages(&self, dir: &Path, reporter: &Reporter) -> Result<bool> {
        let packages = &self.tools.packages;
        if !packages.is_available().await {
            reporter.info("Homebrew not found, skipping package inventory");
            return Ok(false);
        }

        let text = packages.inventory().await?;
        fs::create_dir_all(dir)?;
        fs::write(dir.join(BREWFILE), &text)?;

        let brewfile = Brewfile::parse(&text);
        reporter.info(format!(
            "Package inventory: {} package(s), {} tap(s)",
            brewfile.package_count(),
            brewfile.taps.len()
        ));

        if self.config.sources.package_cache {
            self.stage_package_cache(dir, reporter).await;
        }
        Ok(true)
    }

    /// The cache is optional: any problem leaves the inventory without it.
    async fn stage_package_cache(&self, dir: &Path, reporter: &Reporter) {
        let cache = match self.tools.packages.cache_dir().await {
            Ok(cache) => cache,
            Err(e) => {
                reporter.warn(format!("Package cache not available: {}", e));
                return;
            }
        };

        let limit = self.config.sources.package_cache_limit_bytes;
        let size = self.size_of(&cache).await;
        if size > limit {
            reporter.info(format!(
                "Package cache is {} bytes, above the {} byte limit; not bundled",
                size, limit
            ));
            return;
        }

        let dest = dir.join(PACKAGE_CACHE_DIR);
        let copy_dest = dest.clone();
        let copied = blocking(move || copy_tree(&cache, &copy_dest, true).map_err(SuiteError::from)).await;
        match copied {
            Ok(bytes) => reporter.info(format!("Bundled {} bytes of package cache", bytes)),
            Err(e) => {
                reporter.warn(format!("Package cache copy failed, not bundled: {}", e));
                let _ = fs::remove_dir_all(&dest);
            }
        }
    }

    async fn stage_store_apps(&self, staging: &Path, dir: &Path, reporter: &Reporter) -> Result<bool> {
        let app_store = &self.tools.app_store;
        let lines: Vec<String> = if app_store.is_available().await {
            app_store
                .installed()
                .await?
                .iter()
                .map(StoreApp::to_brewfile_line)
                .collect()
        } else if let Ok(text) = fs::read_to_string(
            staging
                .join(SourceKind::PackageInventory.logical_key().unwrap_or_default())
                .join(BREWFILE),
        ) {
            // The package inventory lists store apps too when mas is registered with brew
            Brewfile::store_app_lines(&text)
        } else {
            reporter.info("mas not found, skipping app store inventory");
            return Ok(false);
        };

        if lines.is_empty() {
            reporter.info("No app store apps found");
            return Ok(false);
        }

        fs::create_dir_all(dir)?;
        fs::write(dir.join(STORE_APPS_FILE), lines.join("\n") + "\n")?;
        reporter.info(format!("App store inventory: {} app(s)", lines.len()));
        Ok(true)
    }

    async fn stage_extensions(&self, dir: &Path, reporter: &Reporter) -> Result<bool> {
        let editor = &self.tools.extensions;
        if !editor.is_available().await {
            reporter.info("Editor CLI not found, skipping extension inventory");
            return Ok(false);
        }

        let extensions = editor.list().await?;
        if extensions.is_empty() {
            reporter.info("No editor extensions installed");
            return Ok(false);
        }

        fs::create_dir_all(dir)?;
        fs::write(dir.join(EXTENSIONS_FILE), extensions.join("\n") + "\n")?;
        reporter.info(format!("Extension inventory: {} extension(s)", extensions.len()));
        Ok(true)
    }

    /// Copies browser files keeping their home-relative layout.
    async fn stage_browser_settings(&self, dir: &Path, reporter: &Reporter) -> Result<bool> {
        let mut staged = 0usize;

        for relative in &self.config.sources.browser_settings_paths {
            let source = self.home.join(relative);
            if fs::symlink_metadata(&source).is_err() {
                continue;
            }
            let check = self.probe.check(&source);
            if !check.readable {
                reporter.warn(format!(
                    "Browser setting {} not readable: {}",
                    relative,
                    check.error_message.unwrap_or_default()
                ));
                continue;
            }

            let dest = dir.join(relative);
            let copied = blocking(move || {
                if source.is_dir() {
                    copy_tree(&source, &dest, true)?;
                } else {
                    if let Some(parent) = dest.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    fs::copy(&source, &dest)?;
                }
                Ok(())
            })
            .await;

            match copied {
                Ok(()) => staged += 1,
                Err(e) => reporter.warn(format!("Browser setting {} not copied: {}", relative, e)),
            }
        }

        if staged == 0 {
            reporter.info("No browser settings found");
            return Ok(false);
        }
        reporter.info(format!("Browser settings: {} location(s)", staged));
        Ok(true)
    }

    /// Best effort: a missing list never fails the backup.
    async fn record_manual_apps(&self, backup_dir: &Path, reporter: &Reporter) {
        let apps_dir = self.config.sources.applications_dir.clone();
        let apps = match blocking(move || {
            manual_apps::installed_app_names(&apps_dir).map_err(SuiteError::from)
        })
        .await
        {
            Ok(apps) => apps,
            Err(e) => {
                debug!("Applications directory not listed: {}", e);
                return;
            }
        };

        let casks = if self.tools.packages.is_available().await {
            self.tools.packages.installed_casks().await.unwrap_or_else(|e| {
                reporter.warn(format!("Cask list unavailable: {}", e));
                Vec::new()
            })
        } else {
            Vec::new()
        };
        let store_apps: Vec<String> = if self.tools.app_store.is_available().await {
            match self.tools.app_store.installed().await {
                Ok(apps) => apps.into_iter().map(|a| a.name).collect(),
                Err(e) => {
                    reporter.warn(format!("App store list unavailable: {}", e));
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        let manual = manual_apps::find_manual_apps(&apps, &casks, &store_apps);
        let mut text = manual.join("\n");
        if !text.is_empty() {
            text.push('\n');
        }
        match fs::write(backup_dir.join(MANUAL_APPS_FILE), text) {
            Ok(()) => reporter.info(format!("{} manually installed app(s) recorded", manual.len())),
            Err(e) => reporter.warn(format!("Manual apps list not written: {}", e)),
        }
    }
}

/// Hands out unique archive file names within one backup
struct ArchiveNames {
    extension: &'static str,
    used: HashSet<String>,
}

impl ArchiveNames {
    fn new(compression: Compression) -> Self {
        Self {
            extension: compression.extension(),
            used: HashSet::new(),
        }
    }

    fn assign(&mut self, name: &str) -> String {
        let stem = archive_stem(name);
        let mut candidate = format!("{}.{}", stem, self.extension);
        let mut suffix = 2;
        while !self.used.insert(candidate.clone()) {
            candidate = format!("{}-{}.{}", stem, suffix, self.extension);
            suffix += 1;
        }
        candidate
    }
}

/// Lower-case, spaces to `-`, dots and separators to `_`.
pub fn archive_stem(name: &str) -> String {
    let stem: String = name
        .to_lowercase()
        .chars()
        .map(|c| match c {
            ' ' => '-',
            '.' | '/' | '\\' | ':' => '_',
            c => c,
        })
        .collect();
    if stem.is_empty() {
        "root".to_string()
    } else {
        stem
    }
}
