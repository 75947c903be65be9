//! CLI argument definitions for layerdiff
//!
//! Uses clap for argument parsing. This module defines all subcommands
//! and their options.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// layerdiff - Build container-image layers without a daemon
///
/// Snapshots a root filesystem, runs build steps against it, and writes the
/// difference after each step as an OCI layer tarball.
#[derive(Parser, Debug)]
#[command(name = "layerdiff")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Increase log verbosity (-v info, -vv debug)
    #[arg(long, short = 'v', global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write the current contents of a root directory as a single layer
    #[command(after_help = "EXAMPLES:
    # Archive a rootfs as layer-000.tar in ./out
    layerdiff snapshot --root ./rootfs --output ./out

    # Byte-for-byte reproducible archive
    layerdiff snapshot --root ./rootfs --reproducible
")]
    Snapshot(SnapshotArgs),

    /// Run build steps against a root directory, writing one layer per step
    #[command(after_help = "EXAMPLES:
    # One layer per step
    layerdiff build --root ./rootfs --step 'mkdir -p app' --step 'echo hi > app/hello'

    # A single layer holding the result of all steps
    layerdiff build --root ./rootfs --single-snapshot --step 'make install'

    # Machine-readable summary
    layerdiff build --root ./rootfs --json --step 'rm -rf var/cache'
")]
    Build(BuildArgs),
}

/// Options shared by every subcommand
#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    /// Root directory to snapshot
    #[arg(long, value_name = "DIR")]
    pub root: PathBuf,

    /// Directory to write layer tarballs into
    #[arg(long, short = 'o', value_name = "DIR", default_value = ".")]
    pub output: PathBuf,

    /// TOML config file with a [snapshot] table
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Additional subtree to exclude (repeatable)
    #[arg(long, value_name = "PATH")]
    pub exclude: Vec<PathBuf>,

    /// Sort entries and zero timestamps
    #[arg(long)]
    pub reproducible: bool,

    /// Print the summary as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct SnapshotArgs {
    #[command(flatten)]
    pub common: CommonArgs,
}

#[derive(Args, Debug)]
pub struct BuildArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Shell command to run inside the root directory (repeatable, in order)
    #[arg(long = "step", value_name = "CMD", required = true)]
    pub steps: Vec<String>,

    /// Snapshot once after the last step instead of after every step
    #[arg(long)]
    pub single_snapshot: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn build_collects_steps_in_order() {
        let cli = Cli::parse_from([
            "layerdiff",
            "build",
            "--root",
            "/rootfs",
            "--step",
            "mkdir app",
            "--step",
            "touch app/x",
            "--single-snapshot",
        ]);
        match cli.command {
            Commands::Build(args) => {
                assert_eq!(args.steps, vec!["mkdir app", "touch app/x"]);
                assert!(args.single_snapshot);
                assert_eq!(args.common.root, PathBuf::from("/rootfs"));
                assert_eq!(args.common.output, PathBuf::from("."));
            }
            other => panic!("expected build, got {:?}", other),
        }
    }

    #[test]
    fn build_requires_a_step() {
        let result = Cli::try_parse_from(["layerdiff", "build", "--root", "/rootfs"]);
        assert!(result.is_err());
    }

    #[test]
    fn verbosity_counts() {
        let cli = Cli::parse_from(["layerdiff", "-vv", "snapshot", "--root", "/rootfs"]);
        assert_eq!(cli.verbose, 2);
    }
}
