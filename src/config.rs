use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

use crate::cache::IdentityScheme;

/// Environment variable overriding the configured endpoint.
pub const ENDPOINT_ENV: &str = "SHELF_ENDPOINT";

/// Environment variable holding the account password for login and signup.
pub const PASSWORD_ENV: &str = "SHELF_PASSWORD";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Catalog server endpoint
  pub endpoint: String,
  /// How entity keys are derived (raw or typed)
  pub identity: IdentityScheme,
  /// Seconds a cached shape is served before it is refetched; null never
  /// refetches
  pub stale_seconds: Option<u64>,
  /// Session database (defaults to the data directory)
  pub token_db: Option<PathBuf>,
  pub log: LogConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      endpoint: "http://localhost:5000/graphql".to_string(),
      identity: IdentityScheme::default(),
      stale_seconds: Some(300),
      token_db: None,
      log: LogConfig::default(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// Filter directive used when RUST_LOG is not set
  pub level: String,
  /// Directory for log files (defaults to the data directory)
  pub dir: Option<PathBuf>,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      dir: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./shelf.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/shelf/config.yaml
  ///
  /// Without a file the defaults apply. `SHELF_ENDPOINT` overrides the
  /// endpoint either way.
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

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };

    let config = config.with_env(|name| std::env::var(name).ok());
    config.endpoint_url()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("shelf.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("shelf").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    // An empty file is a valid, all-defaults configuration.
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  fn with_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
    if let Some(endpoint) = lookup(ENDPOINT_ENV).filter(|e| !e.trim().is_empty()) {
      self.endpoint = endpoint;
    }
    self
  }

  /// Get the account password from the environment.
  ///
  /// Checks SHELF_PASSWORD.
  pub fn get_password() -> Result<String> {
    std::env::var(PASSWORD_ENV)
      .map_err(|_| eyre!("Password not given. Pass it as an argument or set {}.", PASSWORD_ENV))
  }

  pub fn endpoint_url(&self) -> Result<Url> {
    let url = Url::parse(&self.endpoint)
      .map_err(|e| eyre!("Invalid endpoint '{}': {}", self.endpoint, e))?;
    match url.scheme() {
      "http" | "https" => Ok(url),
      other => Err(eyre!("Unsupported endpoint scheme '{}'", other)),
    }
  }

  pub fn stale_time(&self) -> Option<chrono::Duration> {
    self
      .stale_seconds
      .map(|secs| chrono::Duration::seconds(secs.min(i64::MAX as u64) as i64))
  }
}
