use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::audit::SqliteAuditStore;
use crate::cache::CacheSettings;
use crate::mutation::{CoordinatorSettings, RetryPolicy};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub remote: RemoteConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub mutations: MutationsConfig,
  #[serde(default)]
  pub audit: AuditConfig,
  #[serde(default)]
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
  /// Base url; domains live at `{url}/{domain}`
  pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub ttl_secs: u64,
  pub fetch_timeout_ms: u64,
  /// Per-domain overrides, keyed by domain name
  pub domains: BTreeMap<String, DomainCacheConfig>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      ttl_secs: 300,
      fetch_timeout_ms: 10_000,
      domains: BTreeMap::new(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DomainCacheConfig {
  pub ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MutationsConfig {
  pub timeout_ms: u64,
  pub base_delay_ms: u64,
  pub max_delay_ms: u64,
  pub create_retries: u32,
  pub update_retries: u32,
  pub delete_retries: u32,
  pub undo_window_ms: u64,
  pub id_field: String,
}

impl Default for MutationsConfig {
  fn default() -> Self {
    Self {
      timeout_ms: 10_000,
      base_delay_ms: 1000,
      max_delay_ms: 30_000,
      create_retries: 2,
      update_retries: 2,
      delete_retries: 1,
      undo_window_ms: 5000,
      id_field: "id".to_string(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
  /// Database file (defaults to the data directory)
  pub path: Option<PathBuf>,
  pub write_timeout_ms: u64,
}

impl Default for AuditConfig {
  fn default() -> Self {
    Self {
      path: None,
      write_timeout_ms: 2000,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// `tracing_subscriber::EnvFilter` directive; OPTISYNC_LOG wins if set
  pub filter: String,
  pub directory: Option<PathBuf>,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      filter: "info".to_string(),
      directory: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./optisync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/optisync/config.yaml
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
        "No configuration file found. Create one at ~/.config/optisync/config.yaml\n\
                 with at least `remote.url` set."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("optisync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("optisync").join("config.yaml");
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
    if config.mutations.id_field.is_empty() {
      return Err(eyre!("mutations.id_field must not be empty"));
    }
    Ok(config)
  }

  pub fn cache_settings(&self) -> CacheSettings {
    let cache = &self.cache;
    cache.domains.iter().fold(
      CacheSettings::default()
        .with_default_ttl(Duration::from_secs(cache.ttl_secs))
        .with_fetch_timeout(Duration::from_millis(cache.fetch_timeout_ms)),
      |settings, (domain, over)| settings.with_domain_ttl(domain, Duration::from_secs(over.ttl_secs)),
    )
  }

  pub fn retry_policy(&self) -> RetryPolicy {
    let m = &self.mutations;
    RetryPolicy {
      base_delay: Duration::from_millis(m.base_delay_ms),
      max_delay: Duration::from_millis(m.max_delay_ms),
      create_retries: m.create_retries,
      update_retries: m.update_retries,
      delete_retries: m.delete_retries,
    }
  }

  pub fn coordinator_settings(&self) -> CoordinatorSettings {
    CoordinatorSettings {
      write_timeout: Duration::from_millis(self.mutations.timeout_ms),
      retry: self.retry_policy(),
      undo_window: Duration::from_millis(self.mutations.undo_window_ms),
      id_field: self.mutations.id_field.clone(),
    }
  }

  pub fn audit_path(&self) -> Result<PathBuf> {
    match &self.audit.path {
      Some(path) => Ok(path.clone()),
      None => SqliteAuditStore::default_path(),
    }
  }

  pub fn audit_write_timeout(&self) -> Duration {
    Duration::from_millis(self.audit.write_timeout_ms)
  }

  /// Where log files go; next to the audit database unless configured.
  pub fn log_directory(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.log.directory {
      return Ok(dir.clone());
    }
    let audit_path = SqliteAuditStore::default_path()?;
    audit_path
      .parent()
      .map(Path::to_path_buf)
      .ok_or_else(|| eyre!("Could not determine log directory"))
  }
}
