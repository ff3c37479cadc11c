//! Tracing setup for the binary.

use color_eyre::{eyre::eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;

const DEFAULT_FILTER: &str = "gatecache=info,warn";

/// Install the global subscriber.
///
/// `GATECACHE_LOG` overrides the configured filter. With a log directory,
/// output goes to a daily-rotated file through a non-blocking writer; keep the
/// returned guard alive until exit so buffered lines are flushed.
pub fn init(config: &LogConfig) -> Result<Option<WorkerGuard>> {
  let directive = std::env::var("GATECACHE_LOG")
    .ok()
    .or_else(|| config.filter.clone())
    .unwrap_or_else(|| DEFAULT_FILTER.to_string());
  let filter = EnvFilter::try_new(&directive)
    .map_err(|e| eyre!("Invalid log filter '{}': {}", directive, e))?;

  match &config.dir {
    Some(dir) => {
      std::fs::create_dir_all(dir)
        .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;
      let file_appender = tracing_appender::rolling::daily(dir, "gatecache.log");
      let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

      tracing_subscriber::registry()
        .with(
          tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(non_blocking)
            .with_filter(filter),
        )
        .try_init()
        .map_err(|e| eyre!("Failed to install logger: {}", e))?;
      Ok(Some(guard))
    }
    None => {
      tracing_subscriber::registry()
        .with(
          tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr)
            .with_filter(filter),
        )
        .try_init()
        .map_err(|e| eyre!("Failed to install logger: {}", e))?;
      Ok(None)
    }
  }
}
