//! Tick planning: which fabrics get a sync cycle now and which wait.
//!
//! Planning is pure. The runtime feeds it the registry and the set of
//! fabrics it already has in flight; the orchestrator's lease is still the
//! final word on whether a dispatched cycle may run.

use std::cmp::Ordering;
use std::collections::HashSet;

use chrono::{DateTime, Utc};

use fabricsync_core::types::{Fabric, FabricName, SchedulerPriority};

/// A fabric selected for a cycle on this tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    pub fabric: FabricName,
    pub priority: SchedulerPriority,
}

/// Outcome of one scheduler tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickPlan {
    /// In dispatch order.
    pub dispatch: Vec<Dispatch>,
    /// Due, but over the concurrency ceiling; reconsidered next tick.
    pub deferred: Vec<FabricName>,
}

impl TickPlan {
    pub fn is_empty(&self) -> bool {
        self.dispatch.is_empty() && self.deferred.is_empty()
    }
}

/// Plan one tick.
///
/// A fabric is due when the scheduler and sync are both enabled for it,
/// its interval has elapsed (or it never synced), and no cycle for it is in
/// flight. Due fabrics are ordered by effective priority, then by how long
/// they have waited; at most `ceiling − in_flight` are dispatched.
pub fn plan_tick(
    fabrics: &[Fabric],
    now: DateTime<Utc>,
    in_flight: &HashSet<FabricName>,
    ceiling: usize,
    backoff_threshold: u32,
) -> TickPlan {
    let mut due: Vec<(&Fabric, SchedulerPriority)> = fabrics
        .iter()
        .filter(|f| f.is_schedulable() && f.is_due(now) && !in_flight.contains(&f.name))
        .map(|f| (f, f.effective_priority(backoff_threshold)))
        .collect();

    due.sort_by(|(a, pa), (b, pb)| {
        pa.cmp(pb)
            .then_with(|| longest_waiting_first(a.last_cycle(), b.last_cycle()))
            .then_with(|| a.name.cmp(&b.name))
    });

    let capacity = ceiling.saturating_sub(in_flight.len());
    let mut plan = TickPlan::default();
    for (idx, (fabric, priority)) in due.into_iter().enumerate() {
        if idx < capacity {
            plan.dispatch.push(Dispatch {
                fabric: fabric.name.clone(),
                priority,
            });
        } else {
            plan.deferred.push(fabric.name.clone());
        }
    }
    plan
}

fn longest_waiting_first(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => a.cmp(&b),
    }
}
