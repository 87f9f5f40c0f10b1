use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::sync::RetryPolicy;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Database file (defaults to $XDG_DATA_HOME/offsync/offline.db)
  pub database_path: Option<PathBuf>,
  /// Profile used when a command does not name one
  pub owner_id: Option<String>,
  pub remote: RemoteConfig,
  pub connectivity: ConnectivityConfig,
  pub cache: CacheConfig,
  pub sync: SyncConfig,
  pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
  /// Base URL of the row API, e.g. "https://project.example.co/rest/v1"
  pub url: Option<String>,
  pub timeout_secs: u64,
}

impl Default for RemoteConfig {
  fn default() -> Self {
    Self {
      url: None,
      timeout_secs: 30,
    }
  }
}

impl RemoteConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.timeout_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
  /// URL probed for reachability (defaults to the remote url)
  pub probe_url: Option<String>,
  pub interval_secs: u64,
  /// Assumed state before the first probe completes
  pub start_online: bool,
}

impl Default for ConnectivityConfig {
  fn default() -> Self {
    Self {
      probe_url: None,
      interval_secs: 15,
      start_online: true,
    }
  }
}

impl ConnectivityConfig {
  pub fn interval(&self) -> Duration {
    Duration::from_secs(self.interval_secs.max(1))
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Entries younger than this are served without a network read
  pub stale_minutes: i64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self { stale_minutes: 5 }
  }
}

impl CacheConfig {
  pub fn stale_time(&self) -> chrono::Duration {
    chrono::Duration::minutes(self.stale_minutes.max(0))
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  pub retry: RetryConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
  pub enabled: bool,
  pub initial_delay_secs: u64,
  pub max_delay_secs: u64,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      initial_delay_secs: 5,
      max_delay_secs: 300,
    }
  }
}

impl RetryConfig {
  pub fn policy(&self) -> RetryPolicy {
    RetryPolicy {
      enabled: self.enabled,
      initial_delay: Duration::from_secs(self.initial_delay_secs),
      max_delay: Duration::from_secs(self.max_delay_secs.max(self.initial_delay_secs)),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// Write logs to this file instead of stderr
  pub file: Option<PathBuf>,
  /// Filter used when OFFSYNC_LOG is unset
  pub level: String,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      file: None,
      level: "info".to_string(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offsync/config.yaml
  ///
  /// Falls back to defaults when no file exists.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => {
        debug!("No configuration file found, using defaults");
        Ok(Self::default())
      }
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("offsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> std::result::Result<Self, serde_yaml::Error> {
    // An empty file means "all defaults"
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    serde_yaml::from_str(contents)
  }

  /// URL used for reachability probes, if any.
  pub fn probe_url(&self) -> Option<&str> {
    self
      .connectivity
      .probe_url
      .as_deref()
      .or(self.remote.url.as_deref())
  }

  /// Get the remote API key from the environment.
  ///
  /// Checks OFFSYNC_API_KEY. Anonymous access is allowed, so absence is not an error.
  pub fn get_api_key() -> Option<String> {
    std::env::var("OFFSYNC_API_KEY").ok().filter(|k| !k.is_empty())
  }
}
