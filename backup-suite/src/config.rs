//! Configuration management for the backup suite.
//!
//! Loads configuration from a TOML file layered with environment variable
//! overrides (`BACKUP_SUITE__SECTION__KEY`). Every field has a default so an
//! empty or missing file yields a usable configuration.

use crate::codec::Compression;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const ENV_PREFIX: &str = "BACKUP_SUITE";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api: ApiConfig,
    pub backup: BackupConfig,
    pub sources: SourcesConfig,
    pub performance: PerformanceConfig,
    pub restore: RestoreConfig,
    pub tools: ToolsConfig,
    pub volumes: VolumesConfig,
    pub events: EventsConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Address the HTTP/WebSocket server binds to
    pub bind: String,

    /// HTTP/WebSocket server port
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Preferred archive compression (zstd, gzip)
    pub compression: Compression,

    /// Compression level (1-22 for zstd, 0-9 for gzip)
    pub compression_level: i32,

    /// Number of archives written concurrently (1 = sequential)
    pub workers: usize,

    /// File names skipped inside source trees
    pub exclude_patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourcesConfig {
    /// Archive the package manager inventory
    pub package_inventory: bool,

    /// Bundle the package download cache with the inventory
    pub package_cache: bool,

    /// Largest cache that is still bundled
    pub package_cache_limit_bytes: u64,

    /// Archive the app store inventory
    pub app_inventory: bool,

    /// Archive the editor extension inventory
    pub extension_inventory: bool,

    /// Archive browser settings and bookmarks
    pub browser_settings: bool,

    /// Browser files and folders, relative to the home directory
    pub browser_settings_paths: Vec<String>,

    /// Where installed applications live (used for the manual apps list)
    pub applications_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    /// Concurrent archive digests during verification
    pub verify_workers: usize,

    /// Concurrent package / app store installs during restore
    pub package_install_workers: usize,

    /// Concurrent editor extension installs during restore
    pub extension_install_workers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreConfig {
    /// Formulae installed by a quick restore when the backup has them
    pub essential_formulae: Vec<String>,

    /// Casks installed by a quick restore when the backup has them
    pub essential_casks: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Directories searched for package manager CLIs before $PATH
    pub search_dirs: Vec<PathBuf>,

    /// Known editor CLI locations, searched before $PATH
    pub editor_paths: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumesConfig {
    /// Directory whose children are mounted volumes
    pub root: PathBuf,

    /// Volume names never offered as targets
    pub excluded: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Events buffered per subscriber before the oldest are dropped
    pub capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Colored output; turn off when logs go to a file
    pub ansi: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 9991,
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            compression: Compression::Zstd,
            compression_level: 3,
            workers: 1,
            exclude_patterns: vec![".DS_Store".to_string()],
        }
    }
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            package_inventory: true,
            package_cache: false,
            package_cache_limit_bytes: 2 * 1024 * 1024 * 1024, // 2 GiB
            app_inventory: true,
            extension_inventory: true,
            browser_settings: false,
            browser_settings_paths: [
                "Library/Safari/Bookmarks.plist",
                "Library/Safari/ReadingListArchives",
                "Library/Safari/Extensions",
                "Library/Safari/TopSites.plist",
                "Library/Safari/LastSession.plist",
                "Library/Preferences/com.apple.Safari.plist",
                "Library/Containers/com.apple.Safari/Data/Library/Preferences",
            ]
            .iter()
            .map(|p| p.to_string())
            .collect(),
            applications_dir: PathBuf::from("/Applications"),
        }
    }
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            verify_workers: 4,
            package_install_workers: 4,
            extension_install_workers: 6,
        }
    }
}

impl Default for RestoreConfig {
    fn default() -> Self {
        let names = |list: &[&str]| -> Vec<String> { list.iter().map(|n| n.to_string()).collect() };
        Self {
            essential_formulae: names(&[
                "git", "vim", "python", "node", "curl", "wget", "htop", "tree", "jq", "ripgrep", "fd",
                "bat", "fzf",
            ]),
            essential_casks: names(&[
                "visual-studio-code",
                "iterm2",
                "google-chrome",
                "firefox",
                "1password",
                "rectangle",
                "alfred",
            ]),
        }
    }
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            search_dirs: vec![
                PathBuf::from("/opt/homebrew/bin"), // Apple Silicon
                PathBuf::from("/usr/local/bin"),
            ],
            editor_paths: vec![PathBuf::from(
                "/Applications/Visual Studio Code.app/Contents/Resources/app/bin/code",
            )],
        }
    }
}

impl Default for VolumesConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/Volumes"),
            excluded: vec!["Macintosh HD".to_string(), "Macintosh HD - Data".to_string()],
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self { capacity: 1000 }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            ansi: true,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file plus environment overrides.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        Self::load(Some(path))
    }

    /// Load configuration from an optional file plus environment overrides.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        Self::build(path, environment())
    }

    fn build(path: Option<&Path>, env: config::Environment) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }
        let settings = builder.add_source(env).build()?;
        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        let pools = [
            ("backup.workers", self.backup.workers),
            ("performance.verify_workers", self.performance.verify_workers),
            (
                "performance.package_install_workers",
                self.performance.package_install_workers,
            ),
            (
                "performance.extension_install_workers",
                self.performance.extension_install_workers,
            ),
            ("events.capacity", self.events.capacity),
        ];
        for (name, value) in pools {
            if value == 0 {
                anyhow::bail!("{} must be at least 1", name);
            }
        }
        Ok(())
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}
