//! Shared sync pipeline entrypoint used by CLI and daemon.

use std::path::Path;
use std::sync::Arc;

use fabricsync_core::registry;
use fabricsync_core::types::{FabricName, OperationType, SyncOperation};

use crate::local::{DirectoryRepository, SnapshotCluster};
use crate::orchestrator::{OrchestratorConfig, SyncOrchestrator};
use crate::store::ResourceStore;
use crate::SyncError;

/// Scope for a sync pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncScope {
    /// Every registered fabric with sync enabled.
    All,
    /// A single named fabric, enabled or not.
    Fabric(FabricName),
}

/// An orchestrator wired to the filesystem-backed boundaries.
pub fn local_orchestrator(home: &Path, config: OrchestratorConfig) -> SyncOrchestrator {
    let store = ResourceStore::with_ignore_set(config.ignore.clone());
    SyncOrchestrator::new(
        home,
        Arc::new(store),
        Some(Arc::new(DirectoryRepository::new())),
        Some(Arc::new(SnapshotCluster::new())),
        config,
    )
}

/// Run one operation per fabric in `scope`.
///
/// `operation` of `None` runs a regular sync cycle. Per-fabric failures
/// (including `Busy`) are returned alongside the fabric; only a registry
/// failure aborts the whole run.
pub async fn run(
    orchestrator: &SyncOrchestrator,
    home: &Path,
    scope: SyncScope,
    operation: Option<OperationType>,
    initiated_by: &str,
) -> Result<Vec<(FabricName, Result<SyncOperation, SyncError>)>, SyncError> {
    let fabrics = match scope {
        SyncScope::All => registry::list_fabrics_at(home)?
            .into_iter()
            .filter(|f| f.sync_enabled)
            .map(|f| f.name)
            .collect(),
        SyncScope::Fabric(name) => vec![name],
    };

    let mut results = Vec::with_capacity(fabrics.len());
    for fabric in fabrics {
        let outcome = match operation {
            Some(op) => orchestrator.run(&fabric, op, initiated_by).await,
            None => orchestrator.run_cycle(&fabric, initiated_by).await,
        };
        results.push((fabric, outcome));
    }
    Ok(results)
}
