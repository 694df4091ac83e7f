//! External CLI collaborators: package manager, app store, editor.
//!
//! The engine only talks to these traits; `cli` holds the implementations
//! that shell out to `brew`, `mas` and `code`.

pub mod brewfile;
pub mod cli;

pub use brewfile::{Brewfile, Package, PackageKind, StoreApp};
pub use cli::{AppStoreCli, EditorCli, HomebrewCli};

use crate::config::ToolsConfig;
use crate::utils::errors::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;

/// Result of a single install request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    Installed,
    AlreadyPresent,
}

#[async_trait]
pub trait PackageManager: Send + Sync {
    async fn is_available(&self) -> bool;

    /// Serialized package list (Brewfile text)
    async fn inventory(&self) -> Result<String>;

    /// Installed cask tokens, lower-case
    async fn installed_casks(&self) -> Result<Vec<String>>;

    /// Download cache directory
    async fn cache_dir(&self) -> Result<PathBuf>;

    /// Install one tap, formula or cask. `force` reinstalls a package that
    /// is already present; taps ignore it.
    async fn install(&self, package: &Package, force: bool) -> Result<InstallOutcome>;
}

#[async_trait]
pub trait AppStore: Send + Sync {
    async fn is_available(&self) -> bool;

    async fn installed(&self) -> Result<Vec<StoreApp>>;

    async fn install(&self, app_id: &str) -> Result<InstallOutcome>;
}

#[async_trait]
pub trait ExtensionManager: Send + Sync {
    async fn is_available(&self) -> bool;

    async fn list(&self) -> Result<Vec<String>>;

    async fn install(&self, extension: &str, force: bool) -> Result<InstallOutcome>;
}

/// The collaborators one engine works with
#[derive(Clone)]
pub struct Toolchain {
    pub packages: Arc<dyn PackageManager>,
    pub app_store: Arc<dyn AppStore>,
    pub extensions: Arc<dyn ExtensionManager>,
}

impl Toolchain {
    /// CLIs found on this host.
    pub fn host(config: &ToolsConfig) -> Self {
        Self {
            packages: Arc::new(HomebrewCli::locate(config)),
            app_store: Arc::new(AppStoreCli::locate(config)),
            extensions: Arc::new(EditorCli::locate(config)),
        }
    }
}
