use chrono::Duration;
use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::breaker::{
  BreakerOptions, DEFAULT_CACHE_TTL_MS, DEFAULT_COOLDOWN_MS, DEFAULT_MAX_FAILURES,
};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub storage: StorageConfig,
  #[serde(default)]
  pub logging: LoggingConfig,
  #[serde(default)]
  pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
  /// SQLite database (default)
  #[default]
  Sqlite,
  /// Single JSON file, as written by the desktop shell
  Json,
  /// Nothing survives a restart
  Memory,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct StorageConfig {
  #[serde(default)]
  pub backend: StorageBackend,
  /// Overrides the default file location under the data directory
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
  /// Filter directive used when RUST_LOG is unset
  #[serde(default = "default_log_level")]
  pub level: String,
  /// Write daily log files here instead of stderr
  pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: default_log_level(),
      directory: None,
    }
  }
}

fn default_log_level() -> String {
  "info".to_string()
}

/// One upstream data source and its breaker settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct SourceConfig {
  pub name: String,
  pub url: String,
  #[serde(default = "default_max_failures")]
  pub max_failures: u32,
  #[serde(default = "default_cooldown_ms")]
  pub cooldown_ms: u64,
  #[serde(default = "default_cache_ttl_ms")]
  pub cache_ttl_ms: u64,
  #[serde(default)]
  pub persist_cache: bool,
  /// Per-request timeout for the upstream call
  #[serde(default = "default_timeout_ms")]
  pub timeout_ms: u64,
}

fn default_max_failures() -> u32 {
  DEFAULT_MAX_FAILURES
}

fn default_cooldown_ms() -> u64 {
  DEFAULT_COOLDOWN_MS as u64
}

fn default_cache_ttl_ms() -> u64 {
  DEFAULT_CACHE_TTL_MS as u64
}

fn default_timeout_ms() -> u64 {
  10_000
}

impl SourceConfig {
  pub fn breaker_options(&self) -> BreakerOptions {
    BreakerOptions::new(&self.name)
      .with_max_failures(self.max_failures)
      .with_cooldown(millis(self.cooldown_ms))
      .with_cache_ttl(millis(self.cache_ttl_ms))
      .with_persist_cache(self.persist_cache)
  }

  pub fn timeout(&self) -> std::time::Duration {
    std::time::Duration::from_millis(self.timeout_ms)
  }
}

fn millis(ms: u64) -> Duration {
  Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX))
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./feed-breaker.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/feed-breaker/config.yaml
  ///
  /// Without any file the defaults apply.
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
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("feed-breaker.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("feed-breaker").join("config.yaml");
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
      .map_err(|e| eyre!("Invalid config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config =
      serde_yaml::from_str(contents).map_err(|e| eyre!("Failed to parse config: {}", e))?;
    config.validate()?;
    Ok(config)
  }

  /// Source names key the registry and durable storage, so they must be unique.
  fn validate(&self) -> Result<()> {
    let mut seen = BTreeSet::new();
    for source in &self.sources {
      if source.name.trim().is_empty() {
        return Err(eyre!("Source names must not be empty"));
      }
      if !seen.insert(source.name.as_str()) {
        return Err(eyre!("Duplicate source name: {}", source.name));
      }
      url::Url::parse(&source.url)
        .map_err(|e| eyre!("Invalid URL for source {}: {}", source.name, e))?;
    }
    Ok(())
  }

  pub fn source(&self, name: &str) -> Option<&SourceConfig> {
    self.sources.iter().find(|s| s.name == name)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_empty_config_uses_defaults() {
    let config = Config::from_yaml("{}").unwrap();
    assert_eq!(config.storage.backend, StorageBackend::Sqlite);
    assert_eq!(config.logging.level, "info");
    assert!(config.sources.is_empty());
  }

  #[test]
  fn test_source_defaults_match_breaker_defaults() {
    let config = Config::from_yaml(
      r#"
sources:
  - name: usgs
    url: https://earthquake.usgs.gov/feed.geojson
"#,
    )
    .unwrap();

    let options = config.source("usgs").unwrap().breaker_options();
    assert_eq!(options, BreakerOptions::new("usgs"));
    assert_eq!(
      config.source("usgs").unwrap().timeout(),
      std::time::Duration::from_secs(10)
    );
  }

  #[test]
  fn test_full_config() {
    let config = Config::from_yaml(
      r#"
storage:
  backend: json
  path: /tmp/cache.json
logging:
  level: debug
  directory: /tmp/logs
sources:
  - name: fred
    url: https://api.stlouisfed.org/series
    max_failures: 3
    cooldown_ms: 60000
    cache_ttl_ms: 0
    persist_cache: true
    timeout_ms: 2500
"#,
    )
    .unwrap();

    assert_eq!(config.storage.backend, StorageBackend::Json);
    assert_eq!(config.storage.path, Some(PathBuf::from("/tmp/cache.json")));
    assert_eq!(config.logging.directory, Some(PathBuf::from("/tmp/logs")));

    let options = config.sources[0].breaker_options();
    assert_eq!(options.max_failures, 3);
    assert_eq!(options.cooldown, Duration::minutes(1));
    assert!(options.persist_cache);
    assert!(!options.persistence_enabled());
  }

  #[test]
  fn test_duplicate_names_rejected() {
    let err = Config::from_yaml(
      r#"
sources:
  - name: a
    url: https://a.example
  - name: a
    url: https://b.example
"#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("Duplicate source name: a"));
  }

  #[test]
  fn test_invalid_url_rejected() {
    let err = Config::from_yaml(
      r#"
sources:
  - name: broken
    url: not a url
"#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("Invalid URL for source broken"));
  }

  #[test]
  fn test_missing_explicit_path_is_an_error() {
    let err = Config::load(Some(Path::new("/definitely/not/here.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }
}
