mod commands;

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use std::io;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use offsync::config::{Config, LoggingConfig};

#[derive(Parser, Debug)]
#[command(name = "offsync")]
#[command(about = "Offline cache and pending write queue with ordered replay")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/offsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: commands::Command,
}

/// Initialize the tracing subscriber.
///
/// OFFSYNC_LOG overrides the configured level. The returned guard flushes the
/// file writer and must live until exit.
fn init_tracing(logging: &LoggingConfig) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_env("OFFSYNC_LOG")
    .or_else(|_| EnvFilter::try_new(&logging.level))
    .map_err(|e| eyre!("Invalid log level '{}': {}", logging.level, e))?;

  match &logging.file {
    Some(path) => {
      let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
      let name = path
        .file_name()
        .ok_or_else(|| eyre!("Log file path has no file name: {}", path.display()))?;
      if let Some(dir) = dir {
        std::fs::create_dir_all(dir)?;
      }

      let appender = tracing_appender::rolling::never(dir.unwrap_or_else(|| Path::new(".")), name);
      let (writer, guard) = tracing_appender::non_blocking(appender);
      tracing_subscriber::registry()
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .with(filter)
        .init();
      Ok(Some(guard))
    }
    None => {
      tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
      Ok(None)
    }
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _guard = init_tracing(&config.logging)?;

  commands::run(args.command, config).await
}
