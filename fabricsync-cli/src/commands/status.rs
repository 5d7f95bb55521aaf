//! `fabricsync status`: sync health across registered fabrics.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use fabricsync_core::registry;
use fabricsync_core::types::{Fabric, FabricStatusSummary, FabricSyncStatus};

use super::{format_age, home};

/// Arguments for `fabricsync status`.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Limit to one fabric.
    #[arg(long)]
    pub fabric: Option<String>,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Serialize)]
struct StatusReportJson {
    summary: StatusSummaryJson,
    fabrics: Vec<FabricStatusJson>,
}

#[derive(Serialize)]
struct StatusSummaryJson {
    fabrics: usize,
    out_of_sync: usize,
    errors: usize,
}

#[derive(Serialize)]
struct FabricStatusJson {
    #[serde(flatten)]
    summary: FabricStatusSummary,
    scheduler_priority: String,
    failure_streak: u32,
    last_sync_error: Option<String>,
    last_synced_commit: Option<String>,
}

#[derive(Tabled)]
struct StatusTableRow {
    fabric: String,
    status: String,
    drift: u32,
    health: String,
    #[tabled(rename = "last sync")]
    last_sync: String,
    detail: String,
}

impl StatusArgs {
    pub fn run(self) -> Result<()> {
        let home = home()?;
        let mut fabrics = registry::list_fabrics_at(&home)
            .context("failed to load registry; run `fabricsync init` first")?;
        if let Some(filter) = self.fabric.as_ref() {
            fabrics.retain(|f| f.name.0 == *filter);
        }

        if self.json {
            return print_json(&fabrics);
        }
        print_table(&fabrics);
        Ok(())
    }
}

fn print_json(fabrics: &[Fabric]) -> Result<()> {
    let payload = StatusReportJson {
        summary: StatusSummaryJson {
            fabrics: fabrics.len(),
            out_of_sync: count(fabrics, FabricSyncStatus::OutOfSync),
            errors: count(fabrics, FabricSyncStatus::Error),
        },
        fabrics: fabrics
            .iter()
            .map(|f| FabricStatusJson {
                summary: f.status_summary(),
                scheduler_priority: f.scheduler_priority.to_string(),
                failure_streak: f.failure_streak,
                last_sync_error: f.last_sync_error.clone(),
                last_synced_commit: f.last_synced_commit.clone(),
            })
            .collect(),
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&payload).context("failed to serialize status JSON")?
    );
    Ok(())
}

fn print_table(fabrics: &[Fabric]) {
    println!(
        "fabricsync v{} | {} fabrics | {} out of sync | {} errors",
        env!("CARGO_PKG_VERSION"),
        fabrics.len(),
        count(fabrics, FabricSyncStatus::OutOfSync),
        count(fabrics, FabricSyncStatus::Error),
    );

    if fabrics.is_empty() {
        println!("No fabrics registered.");
        return;
    }

    let rows: Vec<StatusTableRow> = fabrics
        .iter()
        .map(|f| StatusTableRow {
            fabric: f.name.to_string(),
            status: format!("{} {}", indicator(f.sync_status), label(f.sync_status)),
            drift: f.drift_count,
            health: format!("{:.2}", f.sync_health_score),
            last_sync: format_age(f.last_sync),
            detail: detail(f),
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");

    if fabrics
        .iter()
        .any(|f| matches!(f.sync_status, FabricSyncStatus::OutOfSync | FabricSyncStatus::Error))
    {
        println!("Run 'fabricsync drift <fabric>' for per-resource detail.");
    }
}

fn count(fabrics: &[Fabric], status: FabricSyncStatus) -> usize {
    fabrics.iter().filter(|f| f.sync_status == status).count()
}

fn label(status: FabricSyncStatus) -> &'static str {
    match status {
        FabricSyncStatus::NeverSynced => "NEVER SYNCED",
        FabricSyncStatus::InSync => "IN SYNC",
        FabricSyncStatus::OutOfSync => "OUT OF SYNC",
        FabricSyncStatus::Syncing => "SYNCING",
        FabricSyncStatus::Error => "ERROR",
    }
}

fn indicator(status: FabricSyncStatus) -> String {
    match status {
        FabricSyncStatus::NeverSynced => "■".bright_black().bold().to_string(),
        FabricSyncStatus::InSync => "■".green().bold().to_string(),
        FabricSyncStatus::OutOfSync => "■".yellow().bold().to_string(),
        FabricSyncStatus::Syncing => "■".blue().bold().to_string(),
        FabricSyncStatus::Error => "■".red().bold().to_string(),
    }
}

fn detail(f: &Fabric) -> String {
    if let Some(err) = &f.last_sync_error {
        return err.clone();
    }
    if f.failure_streak > 0 {
        return format!("{} consecutive failures", f.failure_streak);
    }
    if !f.is_schedulable() {
        return "scheduler off".to_string();
    }
    format!("every {}s, {}", f.sync_interval_secs, f.scheduler_priority)
}
