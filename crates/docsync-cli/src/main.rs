//! docsync command-line driver.
//!
//! ## Usage
//!
//! ```bash
//! # Apply a transform log to a document file
//! docsync replay doc.json transforms.json [--watermark N] [--output out.json]
//!
//! # Accept or reject tracked changes in one serialized block
//! docsync chunk accept block.xml
//!
//! # Run a live session, polling transforms.json on the configured schedule
//! docsync watch doc.json transforms.json --config sync.ron [--seconds 30]
//! ```
//!
//! Logging follows `RUST_LOG`, then the config file's `log_filter`, then
//! `info`. Build with `--features telemetry` for OTLP export.

mod commands;
mod file_channel;
mod files;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use docsync_client::SyncConfig;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::commands::ChunkAction;

/// Client-side document sync tooling.
#[derive(Parser, Debug)]
#[command(name = "docsync")]
#[command(about = "Replay and run block-level document sync")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply a transform log to a document file
    Replay {
        document: PathBuf,
        transforms: PathBuf,

        /// Start from this watermark instead of the document's
        #[arg(long)]
        watermark: Option<u64>,

        /// Write the result here instead of over the input
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Accept or reject tracked changes in a serialized block
    Chunk {
        #[arg(value_enum)]
        action: ChunkAction,
        file: PathBuf,
    },

    /// Run a live session against a transform log on disk
    Watch {
        document: PathBuf,
        transforms: PathBuf,

        /// RON sync configuration
        #[arg(short, long)]
        config: PathBuf,

        /// Append pushed local changes here as JSON lines
        #[arg(long)]
        outbox: Option<PathBuf>,

        /// Stop after this many seconds (default: until Ctrl-C)
        #[arg(long)]
        seconds: Option<u64>,
    },
}

fn env_filter(config_filter: Option<&str>) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config_filter.unwrap_or("info")))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

#[cfg(feature = "telemetry")]
fn init_tracing(config_filter: Option<&str>) -> Option<docsync_telemetry::OtelGuard> {
    let registry = tracing_subscriber::registry()
        .with(env_filter(config_filter))
        .with(fmt::layer().with_writer(std::io::stderr));

    if docsync_telemetry::otel_enabled() {
        match docsync_telemetry::otel_layer("docsync") {
            Ok((otel_layer, guard)) => {
                registry.with(otel_layer).init();
                return Some(guard);
            }
            Err(e) => eprintln!("OTel export disabled: {e}"),
        }
    }
    registry.init();
    None
}

#[cfg(not(feature = "telemetry"))]
fn init_tracing(config_filter: Option<&str>) -> Option<()> {
    tracing_subscriber::registry()
        .with(env_filter(config_filter))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
    None
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let result = match args.command {
        Command::Replay { document, transforms, watermark, output } => {
            let _guard = init_tracing(None);
            commands::replay(&document, &transforms, watermark, output.as_deref())
        }
        Command::Chunk { action, file } => {
            let _guard = init_tracing(None);
            commands::chunk(action, &file)
        }
        Command::Watch { document, transforms, config, outbox, seconds } => {
            match SyncConfig::load(&config) {
                Ok(sync) => {
                    let _guard = init_tracing(sync.log_filter.as_deref());
                    tracing::info!(config = %config.display(), "starting watch");
                    commands::watch(&document, &transforms, &sync, outbox.as_deref(), seconds).await
                }
                Err(e) => {
                    Err(anyhow::Error::new(e).context(format!("loading {}", config.display())))
                }
            }
        }
    };

    match result {
        Ok(out) => {
            print!("{out}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("{e:#}");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_parse_watch() {
        let args = Args::try_parse_from([
            "docsync", "watch", "doc.json", "log.json", "--config", "sync.ron", "--seconds", "5",
        ])
        .unwrap();
        match args.command {
            Command::Watch { config, seconds, outbox, .. } => {
                assert_eq!(config, PathBuf::from("sync.ron"));
                assert_eq!(seconds, Some(5));
                assert!(outbox.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_chunk_action() {
        let args = Args::try_parse_from(["docsync", "chunk", "reject", "b.xml"]).unwrap();
        assert!(matches!(args.command, Command::Chunk { action: ChunkAction::Reject, .. }));
        assert!(Args::try_parse_from(["docsync", "chunk", "merge", "b.xml"]).is_err());
    }
}
