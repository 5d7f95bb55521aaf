//! `fabricsync sync`: run a tracked sync operation for one or all fabrics.

use anyhow::{Context, Result};
use clap::{Args, ValueEnum};

use fabricsync_core::types::{FabricName, OperationStatus, OperationType};
use fabricsync_sync::pipeline::{self, SyncScope};

use super::{block_on, home, orchestrator, print_operation, CLI_INITIATOR};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Direction {
    /// Pull the latest commit and ingest it.
    Pull,
    /// Push desired-state deltas into version control.
    Push,
    /// Re-run conflict detection under the fabric's policy.
    Conflicts,
    /// Create the directory layout (and repository keep-markers).
    Init,
    /// Ingest local raw/ files only.
    Ingest,
}

impl From<Direction> for OperationType {
    fn from(d: Direction) -> Self {
        match d {
            Direction::Pull => OperationType::GithubToGui,
            Direction::Push => OperationType::GuiToGithub,
            Direction::Conflicts => OperationType::ConflictResolution,
            Direction::Init => OperationType::DirectoryInit,
            Direction::Ingest => OperationType::Ingestion,
        }
    }
}

/// Arguments for `fabricsync sync`.
#[derive(Args, Debug)]
pub struct SyncArgs {
    /// Fabric to sync (omit when using `--all`).
    pub fabric: Option<String>,

    /// Sync every fabric with sync enabled.
    #[arg(long, conflicts_with = "fabric")]
    pub all: bool,

    /// Operation to run. Defaults to a regular cycle: pull when a
    /// repository is configured, local ingestion otherwise.
    #[arg(long, value_enum)]
    pub direction: Option<Direction>,
}

impl SyncArgs {
    pub fn run(self) -> Result<()> {
        let home = home()?;
        let scope = if self.all {
            SyncScope::All
        } else {
            let name = self
                .fabric
                .clone()
                .context("provide a fabric name or use --all")?;
            SyncScope::Fabric(FabricName::from(name))
        };

        let orchestrator = orchestrator(&home)?;
        let results = block_on(pipeline::run(
            &orchestrator,
            &home,
            scope,
            self.direction.map(OperationType::from),
            CLI_INITIATOR,
        ))?
        .context("sync failed")?;

        if results.is_empty() {
            println!("No fabrics with sync enabled. Run `fabricsync init` first.");
            return Ok(());
        }

        let mut failed = Vec::new();
        for (fabric, outcome) in results {
            match outcome {
                Ok(op) => {
                    print_operation(&op);
                    if op.status != OperationStatus::Completed {
                        failed.push(fabric.to_string());
                    }
                }
                Err(err) => {
                    println!("✗ '{fabric}': {err}");
                    failed.push(fabric.to_string());
                }
            }
        }

        if !failed.is_empty() {
            anyhow::bail!("sync did not complete for: {}", failed.join(", "));
        }
        Ok(())
    }
}
