//! stripelog: operator tooling for the degraded-write journal.

use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use stripelog_core::{Config, LogFormat, LoggingConfig};
use tracing::debug;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod cli;
mod inspect;

use cli::{Cli, Commands, DecodeArgs, InfoArgs, OutputFormat};
use inspect::{decode_file, render_block, JournalReport};

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config.as_deref())?;
    init_logging(&config.logging);

    match cli.command {
        Commands::Decode(args) => run_decode(&args),
        Commands::Info(args) => run_info(&config, &args),
        Commands::Version => {
            println!("stripelog {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn run_decode(args: &DecodeArgs) -> Result<()> {
    let decoded = decode_file(&args.file, args.lba)?;
    debug!(
        file = %args.file.display(),
        state = ?decoded.header.header_state,
        bitmap = %decoded.header.write_bitmap,
        "Decoded journal header"
    );
    match args.format {
        OutputFormat::Text => print!("{}", render_block(&decoded)),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&decoded)?),
    }
    Ok(())
}

fn run_info(config: &Config, args: &InfoArgs) -> Result<()> {
    let report = JournalReport::from_config(config)?;
    match args.format {
        OutputFormat::Text => print!("{}", report.render()),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
    }
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => Ok(Config::default()),
    }
}

fn init_logging(config: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.level));

    let fmt_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    match config.format {
        LogFormat::Json => {
            tracing_subscriber::registry().with(filter).with(fmt_layer.json()).init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry().with(filter).with(fmt_layer).init();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[journal]\ngroup_id = 3\nabandon_alert_threshold = 4\n\n[geometry]\nwidth = 6\nparity_disks = 2\n"
        )
        .unwrap();

        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.journal.group_id, 3);
        assert_eq!(config.journal.abandon_alert_threshold, 4);
        assert_eq!(config.geometry.width, 6);
    }

    #[test]
    fn test_load_config_defaults_without_path() {
        let config = load_config(None).unwrap();
        assert_eq!(config.journal.slot_count, 508);
    }

    #[test]
    fn test_load_config_reports_invalid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[geometry]\nwidth = 40\n").unwrap();
        let err = load_config(Some(file.path())).unwrap_err();
        assert!(err.to_string().contains("Failed to load configuration"));
    }
}
