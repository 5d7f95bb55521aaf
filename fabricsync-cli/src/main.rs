//! fabricsync: desired/actual state reconciliation for network fabrics.
//!
//! # Usage
//!
//! ```text
//! fabricsync init <path> [--name <fabric>] [--priority high] [--interval 300]
//!                        [--repository <dir> --repo-path <sub>] [--cluster <dir> --kinds VPC,...]
//! fabricsync fabric list
//! fabricsync ingest <fabric> [--dry-run]
//! fabricsync sync <fabric> [--direction pull|push|conflicts|init]
//! fabricsync sync --all
//! fabricsync resolve <fabric> <kind> <name> --keep desired|actual
//! fabricsync status [--json]
//! fabricsync drift <fabric> [--json] [--diff]
//! fabricsync census <fabric>
//! fabricsync daemon start|stop|status|sync|cancel
//! ```

mod commands;

use std::str::FromStr;

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;

use commands::{
    census::CensusArgs, daemon::DaemonCommand, drift::DriftArgs, fabric::FabricCommand,
    ingest::IngestArgs, init::InitArgs, resolve::ResolveArgs, status::StatusArgs, sync::SyncArgs,
};
use fabricsync_core::types::{ArchiveStrategy, ConflictPolicy, SchedulerPriority};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "fabricsync",
    version,
    about = "Reconcile version-controlled fabric resources with the live cluster",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Register a fabric and create its directory layout.
    Init(InitArgs),

    /// Inspect registered fabrics.
    Fabric {
        #[command(subcommand)]
        command: FabricCommand,
    },

    /// Promote files dropped in raw/ into managed/ and the desired state.
    Ingest(IngestArgs),

    /// Run a tracked sync operation.
    Sync(SyncArgs),

    /// Close an open conflict on one resource.
    Resolve(ResolveArgs),

    /// Show sync status across registered fabrics.
    Status(StatusArgs),

    /// Report drift between desired and actual state for a fabric.
    Drift(DriftArgs),

    /// Count resources in raw/, managed/ and the archive.
    Census(CensusArgs),

    /// Run or control the background scheduler daemon.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
}

// ---------------------------------------------------------------------------
// Enum arguments: parsed from the snake_case names used in fabric records
// ---------------------------------------------------------------------------

fn parse_snake<T: DeserializeOwned>(s: &str, expected: &str) -> std::result::Result<T, String> {
    serde_json::from_value(serde_json::Value::String(s.to_ascii_lowercase()))
        .map_err(|_| format!("unknown value '{s}'; expected: {expected}"))
}

/// Thin wrapper so clap can parse `SchedulerPriority`.
#[derive(Debug, Clone)]
pub struct PriorityArg(pub SchedulerPriority);

impl FromStr for PriorityArg {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        parse_snake(s, "critical, high, medium, low, maintenance").map(Self)
    }
}

/// Thin wrapper so clap can parse `ConflictPolicy`.
#[derive(Debug, Clone)]
pub struct PolicyArg(pub ConflictPolicy);

impl FromStr for PolicyArg {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        parse_snake(s, "manual, desired_wins, actual_wins").map(Self)
    }
}

/// Thin wrapper so clap can parse `ArchiveStrategy`.
#[derive(Debug, Clone)]
pub struct ArchiveArg(pub ArchiveStrategy);

impl FromStr for ArchiveArg {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        parse_snake(
            s,
            "rename_with_suffix, move_to_archive, timestamped_copy, none",
        )
        .map(Self)
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Init(args) => args.run(),
        Commands::Fabric { command } => commands::fabric::run(command),
        Commands::Ingest(args) => args.run(),
        Commands::Sync(args) => args.run(),
        Commands::Resolve(args) => args.run(),
        Commands::Status(args) => args.run(),
        Commands::Drift(args) => args.run(),
        Commands::Census(args) => args.run(),
        Commands::Daemon { command } => commands::daemon::run(command),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enum_args_accept_record_spelling() {
        assert_eq!(
            "Desired_Wins".parse::<PolicyArg>().expect("policy").0,
            ConflictPolicy::DesiredWins
        );
        assert_eq!(
            "high".parse::<PriorityArg>().expect("priority").0,
            SchedulerPriority::High
        );
        assert_eq!(
            "move_to_archive".parse::<ArchiveArg>().expect("archive").0,
            ArchiveStrategy::MoveToArchive
        );
    }

    #[test]
    fn unknown_enum_arg_lists_choices() {
        let err = "urgent".parse::<PriorityArg>().expect_err("unknown");
        assert!(err.contains("maintenance"));
    }
}
