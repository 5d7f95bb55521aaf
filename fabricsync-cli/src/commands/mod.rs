pub mod census;
pub mod daemon;
pub mod drift;
pub mod fabric;
pub mod ingest;
pub mod init;
pub mod resolve;
pub mod status;
pub mod sync;

use std::future::Future;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use fabricsync_core::registry;
use fabricsync_core::types::{Fabric, FabricName, SyncOperation};
use fabricsync_daemon::DaemonSettings;
use fabricsync_sync::{pipeline, ResourceStore, SyncOrchestrator};

/// Initiator recorded on operations started from the command line.
pub const CLI_INITIATOR: &str = "cli";

pub fn home() -> Result<PathBuf> {
    dirs::home_dir().context("could not determine home directory")
}

pub fn load_fabric(home: &Path, name: &str) -> Result<Fabric> {
    registry::load_fabric_at(home, &FabricName::from(name))
        .with_context(|| format!("unknown fabric '{name}' (run `fabricsync init` first)"))
}

fn settings(home: &Path) -> Result<DaemonSettings> {
    DaemonSettings::load_at(home).context("failed to load daemon settings")
}

/// Orchestrator over the local boundaries, tuned by `daemon.yaml`.
pub fn orchestrator(home: &Path) -> Result<SyncOrchestrator> {
    Ok(pipeline::local_orchestrator(home, settings(home)?.orchestrator_config()))
}

/// Empty store honouring the `daemon.yaml` ignore-set.
pub fn resource_store(home: &Path) -> Result<ResourceStore> {
    Ok(ResourceStore::with_ignore_set(settings(home)?.ignore_set()))
}

/// Drive `future` to completion on a fresh runtime.
pub fn block_on<F: Future>(future: F) -> Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    Ok(runtime.block_on(future))
}

pub fn print_operation(op: &SyncOperation) {
    println!(
        "{} {} on '{}': {}",
        op.operation_type, op.id, op.fabric, op.status
    );
    println!(
        "  files: {} processed, {} created, {} updated, {} deleted",
        op.files_processed, op.files_created, op.files_updated, op.files_deleted
    );
    if let Some(commit) = &op.commit_sha {
        println!("  commit: {commit}");
    }
    if let Some(message) = &op.error_message {
        println!("  error: {message}");
    }
    for detail in &op.details {
        println!("  · {detail}");
    }
}

/// "3m ago"-style age, or "never".
pub fn format_age(at: Option<DateTime<Utc>>) -> String {
    let Some(at) = at else {
        return "never".to_string();
    };
    let secs = Utc::now().signed_duration_since(at).num_seconds().max(0);
    match secs {
        0..=59 => format!("{secs}s ago"),
        60..=3599 => format!("{}m ago", secs / 60),
        3600..=86_399 => format!("{}h ago", secs / 3600),
        _ => format!("{}d ago", secs / 86_400),
    }
}
