//! Command line interface definition.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Inspect the degraded-write journal of a parity RAID group.
#[derive(Parser)]
#[command(name = "stripelog")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Decode a journal header block image.
    Decode(DecodeArgs),
    /// Print the journal layout derived from the configuration.
    Info(InfoArgs),
    /// Print version information.
    Version,
}

/// Arguments for the decode command.
#[derive(Args)]
pub struct DecodeArgs {
    /// Header block image: the 512-byte data area, optionally followed by
    /// the 8 bytes of block metadata.
    pub file: PathBuf,

    /// Address the block was read from, to check its address stamp.
    #[arg(long)]
    pub lba: Option<u64>,

    /// Output format (text, json).
    #[arg(short, long, default_value = "text")]
    pub format: OutputFormat,
}

/// Arguments for the info command.
#[derive(Args)]
pub struct InfoArgs {
    /// Output format (text, json).
    #[arg(short, long, default_value = "text")]
    pub format: OutputFormat,
}

/// Output format for CLI commands.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
}
