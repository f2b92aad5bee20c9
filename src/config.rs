//! Server configuration.
//!
//! [`Config`] is the runtime configuration handed to [`crate::Server`]; the
//! hook fields let the embedding agent feed live values (MOTD path, banners,
//! environment rewrites) without restarting the server. [`FileConfig`] is the
//! TOML subset the standalone binary loads.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::magic::MagicSessionType;
use crate::x11::{OsX11Network, X11Network};

/// Default offset added to X11 display numbers.
pub const DEFAULT_X11_DISPLAY_OFFSET: u32 = 10;

/// An announcement banner shown on login shells.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Banner {
    pub enabled: bool,
    pub message: String,
}

/// Callback invoked when a reported connection finally disconnects, carrying
/// the exit code and a human-readable reason.
pub type DisconnectFn = Box<dyn FnOnce(i32, &str) + Send>;

/// Lifecycle callback invoked once per accepted connection. The returned
/// closure is guaranteed to be invoked exactly once.
pub type ReportConnectionFn =
    Arc<dyn Fn(Uuid, MagicSessionType, &str) -> DisconnectFn + Send + Sync>;

/// Runtime configuration for the SSH server.
#[derive(Clone)]
pub struct Config {
    /// Absolute connection timeout, none if empty. At 3 seconds or more the
    /// SSH layer switches to keep-alives (3 probes spaced `max_timeout / 3`
    /// apart) instead of a hard deadline.
    pub max_timeout: Option<Duration>,
    /// Returns the path to the message-of-the-day file, if any.
    pub motd_file: Arc<dyn Fn() -> Option<PathBuf> + Send + Sync>,
    /// Returns the announcement banners to show on login shells, in order.
    pub announcement_banners: Arc<dyn Fn() -> Vec<Banner> + Send + Sync>,
    /// Rewrites the environment of commands before execution.
    pub update_env:
        Arc<dyn Fn(Vec<(String, String)>) -> Result<Vec<(String, String)>> + Send + Sync>,
    /// Working directory for commands; empty means the user's home.
    pub working_directory: Arc<dyn Fn() -> Option<PathBuf> + Send + Sync>,
    /// Offset added to X11 display numbers.
    pub x11_display_offset: u32,
    /// Restricts use of file transfer applications. Advisory: a determined
    /// user can rename binaries or upload with curl.
    pub block_file_transfer: bool,
    /// Connection lifecycle reporting.
    pub report_connection: ReportConnectionFn,
    /// Allow connecting to running containers via docker exec.
    pub experimental_containers: bool,
    /// Networking implementation for X11 listeners, overridable in tests.
    pub x11_network: Arc<dyn X11Network>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_timeout: None,
            motd_file: Arc::new(|| None),
            announcement_banners: Arc::new(Vec::new),
            update_env: Arc::new(|env| Ok(env)),
            working_directory: Arc::new(|| None),
            x11_display_offset: DEFAULT_X11_DISPLAY_OFFSET,
            block_file_transfer: false,
            report_connection: Arc::new(|_, _, _| Box::new(|_, _| {})),
            experimental_containers: false,
            x11_network: Arc::new(OsX11Network),
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("max_timeout", &self.max_timeout)
            .field("x11_display_offset", &self.x11_display_offset)
            .field("block_file_transfer", &self.block_file_transfer)
            .field("experimental_containers", &self.experimental_containers)
            .finish_non_exhaustive()
    }
}

/// Configuration file for the standalone binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    /// SSH listen address.
    pub listen_addr: String,

    /// Seed for the deterministic host key. Clients are expected to ignore
    /// host key verification; the overlay network authenticates instead.
    pub host_key_seed: u64,

    /// Path to the message-of-the-day file.
    pub motd_file: Option<PathBuf>,

    /// Announcement banners shown on login shells.
    #[serde(default)]
    pub announcement_banners: Vec<Banner>,

    /// Working directory for new sessions; defaults to the user's home.
    pub working_directory: Option<PathBuf>,

    /// Absolute connection timeout in seconds; 0 disables it.
    pub max_timeout_secs: u64,

    /// Offset added to X11 display numbers.
    pub x11_display_offset: u32,

    /// Restrict file transfer applications (scp, sftp, rsync, nc).
    pub block_file_transfer: bool,

    /// Allow connecting to running containers via docker exec.
    pub experimental_containers: bool,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:2222".to_string(),
            host_key_seed: 42,
            motd_file: None,
            announcement_banners: Vec::new(),
            working_directory: None,
            max_timeout_secs: 0,
            x11_display_offset: DEFAULT_X11_DISPLAY_OFFSET,
            block_file_transfer: false,
            experimental_containers: false,
        }
    }
}

impl FileConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Load configuration from a file, or return defaults if it doesn't exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Build the runtime [`Config`] for this file configuration.
    pub fn runtime_config(&self) -> Config {
        let motd_file = self.motd_file.clone();
        let banners = self.announcement_banners.clone();
        let working_directory = self.working_directory.clone();
        Config {
            max_timeout: match self.max_timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            motd_file: Arc::new(move || motd_file.clone()),
            announcement_banners: Arc::new(move || banners.clone()),
            working_directory: Arc::new(move || working_directory.clone()),
            x11_display_offset: self.x11_display_offset,
            block_file_transfer: self.block_file_transfer,
            experimental_containers: self.experimental_containers,
            ..Config::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_config_roundtrip() {
        let mut config = FileConfig::default();
        config.block_file_transfer = true;
        config.announcement_banners.push(Banner {
            enabled: true,
            message: "welcome".to_string(),
        });

        let content = toml::to_string_pretty(&config).unwrap();
        let parsed: FileConfig = toml::from_str(&content).unwrap();
        assert!(parsed.block_file_transfer);
        assert_eq!(parsed.announcement_banners.len(), 1);
        assert_eq!(parsed.announcement_banners[0].message, "welcome");
    }

    #[test]
    fn test_runtime_config_timeout() {
        let mut config = FileConfig::default();
        assert!(config.runtime_config().max_timeout.is_none());
        config.max_timeout_secs = 30;
        assert_eq!(
            config.runtime_config().max_timeout,
            Some(Duration::from_secs(30))
        );
    }
}
