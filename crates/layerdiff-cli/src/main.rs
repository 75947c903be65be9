//! layerdiff CLI - Build container-image layers from filesystem diffs
//!
//! This is the CLI binary that drives the layerdiff library: it snapshots a
//! root directory, runs build steps, and writes one layer tarball per step.

mod cli;
mod layer_commands;
mod output;

use clap::Parser;
use cli::{Cli, Commands};
use layerdiff::Result;
use tracing::error;
use tracing_subscriber::EnvFilter;

fn main() {
    let cli = Cli::parse();

    // Initialize logging; RUST_LOG wins unless -v was given
    let filter = match cli.verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        _ => EnvFilter::new("debug"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli) {
        error!("{}", e);
        eprintln!("layerdiff: {}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Snapshot(args) => layer_commands::run_snapshot(args),
        Commands::Build(args) => layer_commands::run_build(args),
    }
}
