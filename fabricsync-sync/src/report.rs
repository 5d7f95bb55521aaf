//! Read-only drift report for one fabric, built from its persisted snapshot.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;

use fabricsync_core::types::{ConflictStatus, DriftReportEntry, DriftStatus, FabricName};
use fabricsync_drift::{summarize, DriftSummary};

use crate::store::read_snapshot_at;
use crate::SyncError;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriftReport {
    pub fabric: FabricName,
    pub summary: DriftSummary,
    /// Every resource not in sync, ordered by key.
    pub resources: Vec<DriftReportEntry>,
    /// Open conflicts grouped by kind.
    pub conflicts: BTreeMap<String, Vec<String>>,
}

impl DriftReport {
    pub fn drift_count(&self) -> u32 {
        self.summary.drift_count()
    }
}

pub fn drift_report_at(home: &Path, fabric: &FabricName) -> Result<DriftReport, SyncError> {
    let snapshot = read_snapshot_at(home, fabric)?;
    let summary = summarize(&snapshot);

    let mut conflicts: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut resources = Vec::new();
    for r in &snapshot {
        if r.conflict_status == ConflictStatus::Conflicted {
            conflicts.entry(r.kind.clone()).or_default().push(r.name.clone());
        }
        if r.drift_status != DriftStatus::InSync {
            resources.push(r.drift_report_entry());
        }
    }

    Ok(DriftReport {
        fabric: fabric.clone(),
        summary,
        resources,
        conflicts,
    })
}
