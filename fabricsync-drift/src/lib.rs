//! Drift detection for `fabricsync-drift`.
//!
//! [`DriftDetector::compute`] classifies a resource from its desired and
//! actual spec trees. Rules are checked in order:
//!
//! 1. neither side present → `None` (the caller removes the record)
//! 2. desired only → `desired_only`, score 1.0
//! 3. actual only → `actual_only`, score 1.0
//! 4. both present → structural diff ignoring server-managed paths;
//!    no differing leaf → `in_sync` 0.0, otherwise `spec_drift` with
//!    score = differing leaf paths / leaf paths in the union of both trees.
//!
//! The function is pure: identical inputs always give identical output.

mod ignore;
mod tree;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use fabricsync_core::types::{DriftStatus, FieldDiff, Resource};

pub use ignore::{IgnoreSet, IgnoreSetError, DEFAULT_IGNORED_PATHS};
pub use tree::{leaf_paths, structural_diff, TreeDiff};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Outcome of one drift computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Drift {
    pub status: DriftStatus,
    /// In `[0, 1]`; `0.0` exactly when `status == InSync`.
    pub score: f64,
    pub details: Vec<FieldDiff>,
}

impl Drift {
    fn one_sided(status: DriftStatus) -> Self {
        Self {
            status,
            score: 1.0,
            details: vec![],
        }
    }
}

/// Stateless drift classifier configured with an ignore-set.
#[derive(Debug, Clone, Default)]
pub struct DriftDetector {
    ignore: IgnoreSet,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

impl DriftDetector {
    pub fn new(ignore: IgnoreSet) -> Self {
        Self { ignore }
    }

    pub fn ignore_set(&self) -> &IgnoreSet {
        &self.ignore
    }

    /// Classify a pair of spec trees. `None` means neither side exists.
    pub fn compute(&self, desired: Option<&Value>, actual: Option<&Value>) -> Option<Drift> {
        let (desired, actual) = match (desired, actual) {
            (None, None) => return None,
            (Some(_), None) => return Some(Drift::one_sided(DriftStatus::DesiredOnly)),
            (None, Some(_)) => return Some(Drift::one_sided(DriftStatus::ActualOnly)),
            (Some(d), Some(a)) => (d, a),
        };

        let diff = structural_diff(desired, actual, &self.ignore);
        if diff.differing.is_empty() {
            return Some(Drift {
                status: DriftStatus::InSync,
                score: 0.0,
                details: vec![],
            });
        }

        // union_leaves >= differing.len() >= 1, so the ratio is in (0, 1].
        let score = diff.differing.len() as f64 / diff.union_leaves as f64;
        Some(Drift {
            status: DriftStatus::SpecDrift,
            score: score.min(1.0),
            details: diff.differing,
        })
    }

    /// [`compute`](Self::compute) over both sides of a stored resource.
    pub fn compute_resource(&self, resource: &Resource) -> Option<Drift> {
        self.compute(resource.desired_spec.as_ref(), resource.actual_spec.as_ref())
    }
}

/// Aggregate drift counts for a set of resources.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DriftSummary {
    pub total: u32,
    pub in_sync: u32,
    pub spec_drift: u32,
    pub desired_only: u32,
    pub actual_only: u32,
    pub pending: u32,
    pub mean_score: f64,
}

impl DriftSummary {
    /// Resources not in sync.
    pub fn drift_count(&self) -> u32 {
        self.total - self.in_sync
    }
}

/// Count resources by drift status.
pub fn summarize<'a, I>(resources: I) -> DriftSummary
where
    I: IntoIterator<Item = &'a Resource>,
{
    let mut summary = DriftSummary::default();
    let mut score_sum = 0.0;
    for r in resources {
        summary.total += 1;
        score_sum += r.drift_score;
        match r.drift_status {
            DriftStatus::InSync => summary.in_sync += 1,
            DriftStatus::SpecDrift => summary.spec_drift += 1,
            DriftStatus::DesiredOnly => summary.desired_only += 1,
            DriftStatus::ActualOnly => summary.actual_only += 1,
            DriftStatus::CreationPending | DriftStatus::DeletionPending => summary.pending += 1,
        }
    }
    if summary.total > 0 {
        summary.mean_score = score_sum / f64::from(summary.total);
    }
    summary
}
