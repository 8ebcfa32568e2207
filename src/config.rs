use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::cache::{Eligibility, SqliteStorage};
use crate::transport::Options;

/// Environment variable overriding `store_dir`.
pub const STORE_DIR_ENV: &str = "OFFLINE_HTTP_STORE_DIR";

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("config file not found: {}", .0.display())]
  NotFound(PathBuf),

  #[error("failed to read config file {}: {source}", path.display())]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to parse config file {}: {source}", path.display())]
  Parse {
    path: PathBuf,
    #[source]
    source: serde_yaml::Error,
  },

  #[error("invalid cache_status {0}: not an HTTP status code")]
  InvalidStatus(u16),
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
  /// Directory holding the cache database (default: $TMPDIR/offline-http)
  pub store_dir: Option<PathBuf>,
  /// Serve cached responses before trying the network
  pub prefer_cache: bool,
  /// Only cache responses with this status; everything is cached when unset
  pub cache_status: Option<u16>,
  /// Request timeout for the network client, in seconds
  pub timeout_secs: Option<u64>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offline-http.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offline-http/config.yaml
  ///
  /// Without a config file the defaults are used. `OFFLINE_HTTP_STORE_DIR`
  /// overrides `store_dir` either way.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self, ConfigError> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(ConfigError::NotFound(p.to_path_buf()));
      }
    } else {
      Self::find_config_file()
    };

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };

    if let Some(dir) = std::env::var_os(STORE_DIR_ENV) {
      config.store_dir = Some(PathBuf::from(dir));
    }

    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("offline-http.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offline-http").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
      path: path.to_path_buf(),
      source,
    })?;

    let config: Config = serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
      path: path.to_path_buf(),
      source,
    })?;

    // Reject a bad status up front rather than on first use
    config.options()?;

    Ok(config)
  }

  pub fn store_dir(&self) -> PathBuf {
    self
      .store_dir
      .clone()
      .unwrap_or_else(SqliteStorage::default_dir)
  }

  /// Transport options described by this configuration.
  pub fn options(&self) -> Result<Options, ConfigError> {
    let eligibility = match self.cache_status {
      Some(code) => Eligibility::only_status(code).map_err(|_| ConfigError::InvalidStatus(code))?,
      None => Eligibility::All,
    };

    Ok(Options {
      prefer_cache: self.prefer_cache,
      eligibility,
    })
  }

  pub fn timeout(&self) -> Option<Duration> {
    self.timeout_secs.map(Duration::from_secs)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use reqwest::StatusCode;

  fn write_config(contents: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yaml");
    std::fs::write(&path, contents).unwrap();
    (dir, path)
  }

  #[test]
  fn test_defaults() {
    let config = Config::default();
    assert_eq!(config.store_dir(), SqliteStorage::default_dir());
    assert_eq!(config.options().unwrap(), Options::default());
    assert_eq!(config.timeout(), None);
  }

  #[test]
  fn test_load_from_path() {
    let (_dir, path) = write_config(
      "store_dir: /var/cache/offline\nprefer_cache: true\ncache_status: 200\ntimeout_secs: 5\n",
    );

    let config = Config::load_from_path(&path).unwrap();

    assert_eq!(config.store_dir(), PathBuf::from("/var/cache/offline"));
    assert_eq!(config.timeout(), Some(Duration::from_secs(5)));
    let options = config.options().unwrap();
    assert!(options.prefer_cache);
    assert_eq!(options.eligibility, Eligibility::OnlyStatus(StatusCode::OK));
  }

  #[test]
  fn test_partial_config_uses_defaults() {
    let (_dir, path) = write_config("prefer_cache: true\n");

    let config = Config::load_from_path(&path).unwrap();

    assert!(config.prefer_cache);
    assert_eq!(config.store_dir, None);
    assert_eq!(config.options().unwrap().eligibility, Eligibility::All);
  }

  #[test]
  fn test_invalid_status_rejected() {
    let (_dir, path) = write_config("cache_status: 42\n");
    assert!(matches!(
      Config::load_from_path(&path),
      Err(ConfigError::InvalidStatus(42))
    ));
  }

  #[test]
  fn test_unparseable_config() {
    let (_dir, path) = write_config("prefer_cache: [not, a, bool]\n");
    assert!(matches!(
      Config::load_from_path(&path),
      Err(ConfigError::Parse { .. })
    ));
  }

  #[test]
  fn test_missing_explicit_path() {
    let missing = Path::new("/definitely/not/here/offline-http.yaml");
    assert!(matches!(
      Config::load(Some(missing)),
      Err(ConfigError::NotFound(_))
    ));
  }
}
