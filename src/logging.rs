use color_eyre::{eyre::eyre, Result};
use std::io;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogConfig;

/// Environment variable holding a filter directive (e.g. `imgcache=debug`).
pub const LOG_ENV: &str = "IMGCACHE_LOG";

/// Install the global tracing subscriber.
///
/// Logs go to stderr, and additionally to a daily-rotated file when
/// `config.file` is set. The returned guard must be held until exit so the
/// file writer flushes.
pub fn init(config: &LogConfig) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_env(LOG_ENV)
    .or_else(|_| EnvFilter::try_new(&config.level))
    .map_err(|e| eyre!("Invalid log level '{}': {}", config.level, e))?
    .add_directive("hyper=warn".parse()?)
    .add_directive("reqwest=warn".parse()?);

  let console_layer = fmt::layer().with_target(false).with_writer(io::stderr);

  let (file_layer, guard) = match &config.file {
    Some(path) => {
      let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| std::path::Path::new("."));
      let prefix = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "imgcache.log".to_string());

      let appender = tracing_appender::rolling::daily(dir, prefix);
      let (writer, guard) = tracing_appender::non_blocking(appender);
      let layer = fmt::layer().with_ansi(false).with_writer(writer);
      (Some(layer), Some(guard))
    }
    None => (None, None),
  };

  tracing_subscriber::registry()
    .with(filter)
    .with(console_layer)
    .with(file_layer)
    .try_init()
    .map_err(|e| eyre!("Failed to install tracing subscriber: {}", e))?;

  Ok(guard)
}
