use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{ConsoleError, Result};

/// Filename used when the configured image URL does not end in a zip name.
pub const DEFAULT_IMAGE_FILENAME: &str = "lineage.zip";

const CONFIG_FILE: &str = "flashdeck.toml";

/// Console settings, read from `flashdeck.toml` and overridden by the
/// environment and command line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Address the HTTP API listens on
    pub bind: String,
    /// Full URL of the OS image to flash
    pub image_url: Option<String>,
    /// Expected SHA-256 of the image; downloads that don't match are discarded
    pub image_sha256: Option<String>,
    pub cache_dir: PathBuf,
    pub log_dir: PathBuf,
    pub adb_path: PathBuf,
    pub lsusb_path: PathBuf,
    pub device_scan_interval_secs: u64,
    /// No forward progress for this long fails a download or flash step
    pub stall_timeout_secs: u64,
    pub recovery_timeout_secs: u64,
    pub requires_confirmation: bool,
    pub history_limit: usize,
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("org", "flashdeck", "flashdeck")
}

impl Default for Settings {
    fn default() -> Self {
        let dirs = project_dirs();
        let cache_dir = dirs
            .as_ref()
            .map(|d| d.cache_dir().join("images"))
            .unwrap_or_else(|| PathBuf::from("/tmp/lineage_downloads"));
        let log_dir = dirs
            .as_ref()
            .map(|d| d.data_local_dir().join("logs"))
            .unwrap_or_else(|| PathBuf::from("logs"));

        Self {
            bind: "127.0.0.1:8000".to_string(),
            image_url: None,
            image_sha256: None,
            cache_dir,
            log_dir,
            adb_path: PathBuf::from("adb"),
            lsusb_path: PathBuf::from("lsusb"),
            device_scan_interval_secs: 5,
            stall_timeout_secs: 300,
            recovery_timeout_secs: 120,
            requires_confirmation: true,
            history_limit: 50,
        }
    }
}

impl Settings {
    pub fn default_config_path() -> Option<PathBuf> {
        project_dirs().map(|d| d.config_dir().join(CONFIG_FILE))
    }

    /// Load settings from `path`, or from the default location when it
    /// exists. An explicitly given path must exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match Self::default_config_path() {
                Some(p) if p.exists() => p,
                _ => {
                    info!("No configuration file found, using defaults");
                    return Ok(Self::default());
                }
            },
        };

        let contents = fs::read_to_string(&path).map_err(|e| {
            ConsoleError::Config(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        let settings: Settings = toml::from_str(&contents).map_err(|e| {
            ConsoleError::Config(format!("Failed to parse config {}: {}", path.display(), e))
        })?;

        info!("Loaded configuration from {}", path.display());
        Ok(settings)
    }

    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("LINEAGE_OS_URL").filter(|v| !v.is_empty()) {
            self.image_url = Some(url);
        }
        if let Some(bind) = lookup("FLASHDECK_BIND").filter(|v| !v.is_empty()) {
            self.bind = bind;
        }
        if let Some(dir) = lookup("FLASHDECK_CACHE_DIR").filter(|v| !v.is_empty()) {
            self.cache_dir = PathBuf::from(dir);
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.bind_addr()?;
        if self.device_scan_interval_secs == 0 {
            return Err(ConsoleError::Config(
                "device_scan_interval_secs must be positive".into(),
            ));
        }
        if self.stall_timeout_secs == 0 {
            return Err(ConsoleError::Config("stall_timeout_secs must be positive".into()));
        }
        if let Some(hash) = &self.image_sha256 {
            if hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(ConsoleError::Config(
                    "image_sha256 must be 64 hex characters".into(),
                ));
            }
        }
        if self.image_url.is_none() {
            warn!("Lineage OS URL not configured; only cached images can be flashed");
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.bind
            .parse()
            .map_err(|e| ConsoleError::Config(format!("Invalid bind address {}: {}", self.bind, e)))
    }

    /// Name under which the configured image is cached.
    pub fn image_filename(&self) -> String {
        self.image_url
            .as_deref()
            .and_then(|url| url.split(['?', '#']).next())
            .and_then(|url| url.rsplit('/').next())
            .filter(|name| name.ends_with(".zip"))
            .map(str::to_string)
            .unwrap_or_else(|| DEFAULT_IMAGE_FILENAME.to_string())
    }

    /// Directory part of the image URL, used as the download mirror.
    pub fn mirror_base(&self) -> Option<String> {
        let url = self.image_url.as_deref()?;
        let (base, _) = url.rsplit_once('/')?;
        (!base.is_empty() && base.contains("://")).then(|| base.to_string())
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.device_scan_interval_secs)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }
}
