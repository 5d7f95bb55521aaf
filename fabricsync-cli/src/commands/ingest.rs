//! `fabricsync ingest <fabric> [--dry-run]`

use anyhow::{Context, Result};
use clap::Args;

use fabricsync_core::types::{FabricName, OperationStatus, OperationType};
use fabricsync_sync::{IngestOptions, IngestReport, Ingestor};

use super::{
    block_on, home, load_fabric, orchestrator, print_operation, resource_store, CLI_INITIATOR,
};

/// Arguments for `fabricsync ingest`.
#[derive(Args, Debug)]
pub struct IngestArgs {
    /// Fabric whose raw/ directory is ingested.
    pub fabric: String,

    /// Report what would change without touching any file or state.
    #[arg(long)]
    pub dry_run: bool,
}

impl IngestArgs {
    pub fn run(self) -> Result<()> {
        let home = home()?;
        if self.dry_run {
            let fabric = load_fabric(&home, &self.fabric)?;
            let store = resource_store(&home)?;
            store
                .load_at(&home, &fabric.name)
                .context("failed to load resource snapshot")?;
            let report = Ingestor::new(&home, &fabric, &store)
                .run(&IngestOptions {
                    dry_run: true,
                    commit: None,
                })
                .with_context(|| format!("ingestion dry run failed for '{}'", self.fabric))?;
            print_report(&self.fabric, &report);
            return Ok(());
        }

        let orchestrator = orchestrator(&home)?;
        let name = FabricName::from(self.fabric.clone());
        let op = block_on(orchestrator.run(&name, OperationType::Ingestion, CLI_INITIATOR))?
            .with_context(|| format!("ingestion failed for '{}'", self.fabric))?;
        print_operation(&op);
        if op.status != OperationStatus::Completed {
            anyhow::bail!("ingestion {} for '{}'", op.status, self.fabric);
        }
        Ok(())
    }
}

fn print_report(fabric: &str, report: &IngestReport) {
    println!(
        "[dry-run] '{fabric}': {} files discovered, {} would be processed, {} unchanged",
        report.files_discovered, report.files_processed, report.files_unchanged
    );
    println!(
        "  managed/: {} to create, {} to update, {} unchanged",
        report.managed_created, report.managed_updated, report.managed_unchanged
    );
    for path in &report.archived {
        println!("  ~  would archive {}", path.display());
    }
    for failure in &report.failures {
        println!("  ✗  {}: {}", failure.path.display(), failure.message);
    }
}
