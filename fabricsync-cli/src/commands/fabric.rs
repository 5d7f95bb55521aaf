//! `fabricsync fabric list`

use anyhow::{Context, Result};
use clap::Subcommand;
use tabled::{settings::Style, Table, Tabled};

use fabricsync_core::registry;

use super::{format_age, home};

/// Inspect registered fabrics.
#[derive(Subcommand, Debug)]
pub enum FabricCommand {
    /// List registered fabrics and their sync configuration.
    List,
}

#[derive(Tabled)]
struct FabricRow {
    fabric: String,
    root: String,
    priority: String,
    #[tabled(rename = "interval")]
    interval: String,
    scheduler: String,
    #[tabled(rename = "last sync")]
    last_sync: String,
}

pub fn run(cmd: FabricCommand) -> Result<()> {
    match cmd {
        FabricCommand::List => list(),
    }
}

fn list() -> Result<()> {
    let home = home()?;
    let fabrics = registry::list_fabrics_at(&home)
        .context("failed to load registry; run `fabricsync init` first")?;

    if fabrics.is_empty() {
        println!("No fabrics registered.");
        println!("Run: fabricsync init <path> --name <fabric>");
        return Ok(());
    }

    let rows: Vec<FabricRow> = fabrics
        .iter()
        .map(|f| FabricRow {
            fabric: f.name.to_string(),
            root: f.root.display().to_string(),
            priority: f.scheduler_priority.to_string(),
            interval: format!("{}s", f.sync_interval_secs),
            scheduler: if f.is_schedulable() { "on" } else { "off" }.to_string(),
            last_sync: format_age(f.last_sync),
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
    Ok(())
}
