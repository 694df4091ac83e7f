//! Subprocess-backed collaborators.

use super::brewfile::{parse_mas_list, Package, PackageKind, StoreApp};
use super::{AppStore, ExtensionManager, InstallOutcome, PackageManager};
use crate::config::ToolsConfig;
use crate::utils::errors::{Result, SuiteError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

const ALREADY_INSTALLED: &str = "already installed";
const NOT_INSTALLED: &str = "not installed";

/// Find `name` in the configured directories, then on `$PATH`.
///
/// GUI-launched processes often get a minimal `$PATH`, hence the explicit
/// search directories first.
pub fn find_command(name: &str, search_dirs: &[PathBuf]) -> Option<PathBuf> {
    let from_path = std::env::var_os("PATH")
        .map(|p| std::env::split_paths(&p).collect::<Vec<_>>())
        .unwrap_or_default();

    search_dirs
        .iter()
        .chain(from_path.iter())
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// Run a CLI and return stdout, or a `Tool` error with the first stderr line.
async fn run(tool: &str, program: &Path, args: &[&str]) -> Result<String> {
    debug!("Running {} {}", program.display(), args.join(" "));
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| SuiteError::tool(tool, e))?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let message = stderr
            .lines()
            .find(|l| !l.trim().is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("exited with {}", output.status));
        Err(SuiteError::tool(tool, message))
    }
}

/// Install commands report "already installed" either as success or as a failure.
async fn run_install(tool: &str, program: &Path, args: &[&str]) -> Result<InstallOutcome> {
    match run(tool, program, args).await {
        Ok(stdout) if stdout.contains(ALREADY_INSTALLED) => Ok(InstallOutcome::AlreadyPresent),
        Ok(_) => Ok(InstallOutcome::Installed),
        Err(SuiteError::Tool { message, .. }) if message.contains(ALREADY_INSTALLED) => {
            Ok(InstallOutcome::AlreadyPresent)
        }
        Err(e) => Err(e),
    }
}

fn missing(tool: &str) -> SuiteError {
    SuiteError::tool(tool, "not installed")
}

fn brew_install_args(kind: PackageKind, name: &str, force: bool) -> Vec<&str> {
    let verb = if force { "reinstall" } else { "install" };
    match kind {
        PackageKind::Tap => vec!["tap", name],
        PackageKind::Formula => vec![verb, name],
        PackageKind::Cask => vec![verb, "--cask", name],
    }
}

pub struct HomebrewCli {
    brew: Option<PathBuf>,
}

impl HomebrewCli {
    pub fn locate(config: &ToolsConfig) -> Self {
        Self {
            brew: find_command("brew", &config.search_dirs),
        }
    }

    fn brew(&self) -> Result<&Path> {
        self.brew.as_deref().ok_or_else(|| missing("brew"))
    }
}

#[async_trait]
impl PackageManager for HomebrewCli {
    async fn is_available(&self) -> bool {
        self.brew.is_some()
    }

    async fn inventory(&self) -> Result<String> {
        run("brew", self.brew()?, &["bundle", "dump", "--file=-"]).await
    }

    async fn installed_casks(&self) -> Result<Vec<String>> {
        let stdout = run("brew", self.brew()?, &["list", "--cask"]).await?;
        Ok(stdout
            .lines()
            .map(|l| l.trim().to_lowercase())
            .filter(|l| !l.is_empty())
            .collect())
    }

    async fn cache_dir(&self) -> Result<PathBuf> {
        let stdout = run("brew", self.brew()?, &["--cache"]).await?;
        Ok(PathBuf::from(stdout.trim()))
    }

    async fn install(&self, package: &Package, force: bool) -> Result<InstallOutcome> {
        let brew = self.brew()?;
        let name = package.name.as_str();
        let args = brew_install_args(package.kind, name, force);
        match run_install("brew", brew, &args).await {
            // `reinstall` refuses packages that were never installed
            Err(SuiteError::Tool { message, .. }) if force && message.contains(NOT_INSTALLED) => {
                run_install("brew", brew, &brew_install_args(package.kind, name, false)).await
            }
            other => other,
        }
    }
}

pub struct AppStoreCli {
    mas: Option<PathBuf>,
}

impl AppStoreCli {
    pub fn locate(config: &ToolsConfig) -> Self {
        Self {
            mas: find_command("mas", &config.search_dirs),
        }
    }
}

#[async_trait]
impl AppStore for AppStoreCli {
    async fn is_available(&self) -> bool {
        self.mas.is_some()
    }

    async fn installed(&self) -> Result<Vec<StoreApp>> {
        let mas = self.mas.as_deref().ok_or_else(|| missing("mas"))?;
        Ok(parse_mas_list(&run("mas", mas, &["list"]).await?))
    }

    async fn install(&self, app_id: &str) -> Result<InstallOutcome> {
        let mas = self.mas.as_deref().ok_or_else(|| missing("mas"))?;
        run_install("mas", mas, &["install", app_id]).await
    }
}

pub struct EditorCli {
    code: Option<PathBuf>,
}

impl EditorCli {
    pub fn locate(config: &ToolsConfig) -> Self {
        let code = config
            .editor_paths
            .iter()
            .find(|p| p.is_file())
            .cloned()
            .or_else(|| find_command("code", &config.search_dirs));
        Self { code }
    }
}

#[async_trait]
impl ExtensionManager for EditorCli {
    async fn is_available(&self) -> bool {
        self.code.is_some()
    }

    async fn list(&self) -> Result<Vec<String>> {
        let code = self.code.as_deref().ok_or_else(|| missing("code"))?;
        let stdout = run("code", code, &["--list-extensions"]).await?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn install(&self, extension: &str, force: bool) -> Result<InstallOutcome> {
        let code = self.code.as_deref().ok_or_else(|| missing("code"))?;
        let mut args = vec!["--install-extension", extension];
        if force {
            args.push("--force");
        }
        run_install("code", code, &args).await
    }
}
