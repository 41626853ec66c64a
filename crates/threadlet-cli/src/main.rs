//! Threadlet workload CLI
//!
//! Loads a TOML workload of threadlets and tasks, drives a scheduler over it
//! and reports how the dispatches were interleaved.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

mod commands;
mod output;
mod simulate;
mod telemetry;
mod workload;

#[derive(Parser)]
#[command(name = "threadlet")]
#[command(about = "Cooperative scheduling workload simulator", long_about = None)]
#[command(version)]
struct Cli {
    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    log_json: bool,

    /// Color output: auto, always or never
    #[arg(long, global = true)]
    color: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

/// Report format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    /// Human-readable, colored
    Text,
    /// Pretty-printed JSON
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Simulate a workload and print a scheduling report
    Run {
        /// Workload file
        file: PathBuf,
        /// Report format
        #[arg(short, long, value_enum, default_value_t = Format::Text)]
        format: Format,
        /// Include the per-dispatch timeline
        #[arg(long)]
        trace: bool,
        /// Override the workload's jitter seed
        #[arg(long)]
        seed: Option<u64>,
        /// Abort after this many dispatches
        #[arg(long)]
        max_dispatches: Option<u64>,
    },

    /// Validate a workload without running it
    Check {
        /// Workload file
        file: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    telemetry::init(cli.log_json);

    match cli.command {
        Commands::Run {
            file,
            format,
            trace,
            seed,
            max_dispatches,
        } => commands::run::execute(
            &file,
            commands::run::RunOptions {
                format,
                trace,
                seed,
                max_dispatches,
                color: cli.color.as_deref(),
            },
        ),

        Commands::Check { file } => commands::check::execute(&file, cli.color.as_deref()),
    }
}
