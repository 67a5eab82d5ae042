//! Logging setup for the `docsearchd` binary: console for interactive
//! subcommands, file-backed for `serve` in the background. Grounded on the
//! lineage's CLI `logging` module — same foreground/background split, same
//! `tracing_appender::rolling` + `non_blocking` pairing.

use std::path::Path;

use docsearch_engine::ProcessingConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

fn parse_log_level(level: &str) -> tracing::Level {
  match level.to_lowercase().as_str() {
    "off" | "error" => tracing::Level::ERROR,
    "warn" => tracing::Level::WARN,
    "debug" => tracing::Level::DEBUG,
    "trace" => tracing::Level::TRACE,
    _ => tracing::Level::INFO,
  }
}

/// Console-only logging for one-shot subcommands (`ingest`, `status`, `search`).
pub fn init_cli_logging() {
  let _ = tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())).try_init();
}

/// Logging for `serve`, driven by [`ProcessingConfig::log_level`] /
/// [`ProcessingConfig::log_format`]. Returns the guard that must stay alive
/// for the process lifetime when file logging is in effect.
pub fn init_serve_logging(config: &ProcessingConfig) -> Option<WorkerGuard> {
  let level = parse_log_level(&config.log_level);
  let env_filter = EnvFilter::builder().with_default_directive(level.into()).from_env_lossy();
  let ansi = config.log_format != "json";

  match &config.log_file {
    None => {
      let builder = tracing_subscriber::fmt().with_env_filter(env_filter).with_target(true).with_ansi(ansi);
      if config.log_format == "json" { builder.json().init() } else { builder.init() }
      None
    }
    Some(path) => {
      let dir = path.parent().unwrap_or_else(|| Path::new("."));
      if std::fs::create_dir_all(dir).is_err() {
        init_cli_logging();
        return None;
      }
      let filename = path.file_name().and_then(|n| n.to_str()).unwrap_or("docsearchd.log");
      let file_appender = tracing_appender::rolling::daily(dir, filename);
      let (writer, guard) = tracing_appender::non_blocking(file_appender);
      let builder = tracing_subscriber::fmt().with_env_filter(env_filter).with_target(true).with_ansi(false).with_writer(writer);
      if config.log_format == "json" { builder.json().init() } else { builder.init() }
      Some(guard)
    }
  }
}
