use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::rules::{Rule, RuleTable};

/// Name of the unversioned partition holding dynamically cached responses.
pub const RUNTIME_PARTITION: &str = "runtime-cache";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Prefix of the core partition name (`<app>-cache-v<N>`)
  pub app_name: String,
  /// Build identifier of this agent generation
  #[serde(default = "default_cache_version")]
  pub cache_version: u32,
  /// Origin whose pages the agent controls
  pub origin: Url,
  /// Paths precached into the core partition on install
  #[serde(default = "default_precache")]
  pub precache: Vec<String>,
  /// Endpoint whose failed POSTs are queued for background replay
  #[serde(default = "default_forms_endpoint")]
  pub forms_endpoint: String,
  /// Tag of the sync event that triggers replay
  #[serde(default = "default_sync_tag")]
  pub sync_tag: String,
  #[serde(default)]
  pub network: NetworkConfig,
  #[serde(default)]
  pub notifications: NotificationConfig,
  /// Replaces the built-in rule table when set
  #[serde(default)]
  pub rules: Option<Vec<Rule>>,
  /// Cache database path (default: $XDG_DATA_HOME/cachet/cache.db)
  pub database: Option<PathBuf>,
}

/// Partition names of one agent generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionNames {
  /// Versioned partition of precached assets
  pub core: String,
  /// Unversioned partition of runtime responses and queued writes
  pub runtime: String,
}

impl PartitionNames {
  /// True for partitions this generation keeps on activation.
  pub fn is_current(&self, name: &str) -> bool {
    name == self.core || name == self.runtime
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self {
      timeout_secs: default_timeout_secs(),
    }
  }
}

impl NetworkConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.timeout_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationConfig {
  #[serde(default = "default_icon")]
  pub icon: String,
  #[serde(default = "default_badge")]
  pub badge: String,
}

impl Default for NotificationConfig {
  fn default() -> Self {
    Self {
      icon: default_icon(),
      badge: default_badge(),
    }
  }
}

fn default_cache_version() -> u32 {
  1
}

fn default_precache() -> Vec<String> {
  vec![
    "/".to_string(),
    "/manifest.json".to_string(),
    "/static/js/".to_string(),
    "/static/css/".to_string(),
  ]
}

fn default_forms_endpoint() -> String {
  "/api/forms".to_string()
}

fn default_sync_tag() -> String {
  "sync-forms".to_string()
}

fn default_timeout_secs() -> u64 {
  10
}

fn default_icon() -> String {
  "/icons/icon-192x192.png".to_string()
}

fn default_badge() -> String {
  "/icons/badge-72x72.png".to_string()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./cachet.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/cachet/config.yaml
  /// 4. ~/.config/cachet/config.yaml
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
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/cachet/config.yaml\n\
                 See cachet.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("cachet.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("cachet").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    if config.app_name.trim().is_empty() {
      return Err(eyre!("app_name must not be empty"));
    }
    Ok(config)
  }

  /// Name of this generation's core partition.
  pub fn core_partition(&self) -> String {
    format!("{}-cache-v{}", self.app_name, self.cache_version)
  }

  pub fn partition_names(&self) -> PartitionNames {
    PartitionNames {
      core: self.core_partition(),
      runtime: RUNTIME_PARTITION.to_string(),
    }
  }

  /// Precache manifest resolved against the origin.
  pub fn precache_urls(&self) -> Result<Vec<Url>> {
    self.precache.iter().map(|p| self.resolve(p)).collect()
  }

  pub fn forms_url(&self) -> Result<Url> {
    self.resolve(&self.forms_endpoint)
  }

  pub fn resolve(&self, path: &str) -> Result<Url> {
    self
      .origin
      .join(path)
      .map_err(|e| eyre!("Invalid path {} for origin {}: {}", path, self.origin, e))
  }

  pub fn rule_table(&self) -> RuleTable {
    match &self.rules {
      Some(rules) => RuleTable::new(rules.clone()),
      None => RuleTable::builtin(),
    }
  }

  /// Directory for the cache database and log files.
  pub fn data_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("cachet"))
  }

  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.database {
      Some(path) => Ok(path.clone()),
      None => Ok(Self::data_dir()?.join("cache.db")),
    }
  }
}
