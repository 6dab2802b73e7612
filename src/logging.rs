//! Logging setup for the binary.
//!
//! Output goes to a daily-rolling file so the terminal only carries command
//! output. `RUST_LOG`, when set, takes precedence over the configured level.

use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;

const LOG_FILE_PREFIX: &str = "shelf.log";

/// Build the filter from `RUST_LOG` or the configured level, keeping noisy
/// dependencies quiet.
fn build_env_filter(level: &str) -> Result<EnvFilter> {
  if let Ok(filter) = EnvFilter::try_from_default_env() {
    return Ok(filter);
  }

  let mut directives = vec![level.to_string()];
  for (target, lvl) in [("hyper", "warn"), ("reqwest", "warn"), ("rustls", "warn")] {
    directives.push(format!("{}={}", target, lvl));
  }

  let filter = directives.join(",");
  EnvFilter::try_new(&filter).map_err(|e| eyre!("Invalid log filter '{}': {}", filter, e))
}

/// Default log directory: `<data dir>/shelf/logs`.
pub fn default_dir() -> Result<PathBuf> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?;
  Ok(data_dir.join("shelf").join("logs"))
}

/// Install the global subscriber.
///
/// Keep the returned guard alive for the life of the process; dropping it
/// flushes and stops the background writer.
pub fn init(config: &LogConfig) -> Result<WorkerGuard> {
  let dir = match &config.dir {
    Some(dir) => dir.clone(),
    None => default_dir()?,
  };
  init_in(&dir, &config.level)
}

fn init_in(dir: &Path, level: &str) -> Result<WorkerGuard> {
  std::fs::create_dir_all(dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
  let (writer, guard) = tracing_appender::non_blocking(appender);

  let file_layer = tracing_subscriber::fmt::layer()
    .with_ansi(false)
    .with_target(true)
    .with_writer(writer);

  tracing_subscriber::registry()
    .with(build_env_filter(level)?)
    .with(file_layer)
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}
