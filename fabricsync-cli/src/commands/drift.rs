//! `fabricsync drift <fabric>`: per-resource drift report.

use anyhow::{Context, Result};
use clap::Args;
use tabled::{settings::Style, Table, Tabled};

use fabricsync_sync::diff::diff_fabric;
use fabricsync_sync::{drift_report_at, DriftReport};

use super::{home, load_fabric, resource_store};

/// Arguments for `fabricsync drift`.
#[derive(Args, Debug)]
pub struct DriftArgs {
    pub fabric: String,

    /// Emit machine-readable JSON.
    #[arg(long, conflicts_with = "diff")]
    pub json: bool,

    /// Print a unified diff of desired (a/) against actual (b/) per resource.
    #[arg(long)]
    pub diff: bool,
}

#[derive(Tabled)]
struct DriftRow {
    resource: String,
    status: String,
    score: String,
    fields: String,
    conflict: String,
}

impl DriftArgs {
    pub fn run(self) -> Result<()> {
        let home = home()?;
        let fabric = load_fabric(&home, &self.fabric)?;

        if self.diff {
            let store = resource_store(&home)?;
            store
                .load_at(&home, &fabric.name)
                .context("failed to load resource snapshot")?;
            let result = diff_fabric(&store, &fabric.name)
                .with_context(|| format!("diff failed for '{}'", self.fabric))?;
            if result.diffs.is_empty() {
                println!("No differences for '{}'.", result.fabric);
                return Ok(());
            }
            for diff in result.diffs {
                print!("{}", diff.unified_diff);
                if !diff.unified_diff.ends_with('\n') {
                    println!();
                }
            }
            return Ok(());
        }

        let report = drift_report_at(&home, &fabric.name)
            .with_context(|| format!("drift report failed for '{}'", self.fabric))?;
        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("failed to serialize drift JSON")?
            );
            return Ok(());
        }
        print_table(&report);
        Ok(())
    }
}

fn print_table(report: &DriftReport) {
    let s = &report.summary;
    println!(
        "'{}': {} resources | {} in sync | {} spec drift | {} desired only | {} actual only | {} pending",
        report.fabric, s.total, s.in_sync, s.spec_drift, s.desired_only, s.actual_only, s.pending
    );
    if report.resources.is_empty() {
        println!("No drift.");
        return;
    }

    let rows: Vec<DriftRow> = report
        .resources
        .iter()
        .map(|e| DriftRow {
            resource: format!("{}/{}/{}", e.namespace, e.kind, e.name),
            status: e.drift_status.to_string(),
            score: format!("{:.2}", e.drift_score),
            fields: summarize_fields(&e.differing_fields),
            conflict: e.conflict_status.to_string(),
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");

    for (kind, names) in &report.conflicts {
        println!("conflicted {kind}: {}", names.join(", "));
    }
}

fn summarize_fields(fields: &[String]) -> String {
    if fields.is_empty() {
        return "-".to_string();
    }
    let mut shown: Vec<String> = fields.iter().take(3).cloned().collect();
    if fields.len() > shown.len() {
        shown.push(format!("+{} more", fields.len() - shown.len()));
    }
    shown.join(", ")
}
