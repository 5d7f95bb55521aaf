//! Remote state collection: cluster objects → actual side of the store.
//!
//! A refresh lists each configured kind independently; a kind that cannot
//! be listed is reported and skipped without touching the resources of the
//! other kinds. Only a successful listing may remove actual state.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;

use fabricsync_core::types::{Fabric, FabricName, ResourceKey};

use crate::boundary::{ClusterClient, RemoteObject, WatchEvent, WatchEventKind};
use crate::cancel::CancelFlag;
use crate::error::SyncError;
use crate::retry::{self, CallPolicy};
use crate::store::{ActualState, ResourceFilter, ResourceStore};

/// Outcome of collecting one kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KindOutcome {
    pub kind: String,
    pub observed: u32,
    pub removed: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CollectionReport {
    pub kinds: Vec<KindOutcome>,
    pub cancelled: bool,
}

impl CollectionReport {
    pub fn failed_kinds(&self) -> impl Iterator<Item = &KindOutcome> {
        self.kinds.iter().filter(|k| k.error.is_some())
    }

    /// Every kind failed; the cluster as a whole is unreachable.
    pub fn all_failed(&self) -> bool {
        !self.kinds.is_empty() && self.kinds.iter().all(|k| k.error.is_some())
    }

    pub fn observed(&self) -> u32 {
        self.kinds.iter().map(|k| k.observed).sum()
    }
}

pub struct RemoteStateCollector {
    client: Arc<dyn ClusterClient>,
    policy: CallPolicy,
}

impl RemoteStateCollector {
    pub fn new(client: Arc<dyn ClusterClient>, policy: CallPolicy) -> Self {
        Self { client, policy }
    }

    /// Kinds to collect: the configured list, else every kind the fabric
    /// already tracks.
    pub fn kinds_for(fabric: &Fabric, store: &ResourceStore) -> Vec<String> {
        if let Some(cluster) = &fabric.cluster {
            if !cluster.kinds.is_empty() {
                return cluster.kinds.clone();
            }
        }
        store
            .list_by_fabric(&fabric.name, &ResourceFilter::default())
            .into_iter()
            .map(|r| r.kind)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// List every kind once and fold the results into `store`.
    pub async fn refresh(
        &self,
        fabric: &Fabric,
        store: &ResourceStore,
        cancel: &CancelFlag,
    ) -> Result<CollectionReport, SyncError> {
        let Some(cluster) = &fabric.cluster else {
            return Ok(CollectionReport::default());
        };

        let mut report = CollectionReport::default();
        for kind in Self::kinds_for(fabric, store) {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let target = format!("cluster {} ({kind})", cluster.server);
            let listed = retry::call(self.policy, &target, || {
                self.client.list_resources(cluster, &kind)
            })
            .await;

            let outcome = match listed {
                Ok(objects) => apply_listing(store, &fabric.name, &kind, objects)?,
                Err(e) => {
                    tracing::warn!("collect {}: {e}", fabric.name);
                    KindOutcome {
                        kind: kind.clone(),
                        error: Some(e.to_string()),
                        ..KindOutcome::default()
                    }
                }
            };
            report.kinds.push(outcome);
        }

        tracing::info!(
            "collected {}: {} object(s), {} kind(s) failed",
            fabric.name,
            report.observed(),
            report.failed_kinds().count()
        );
        Ok(report)
    }

    /// Apply watch events until the stream ends or `cancel` is set.
    ///
    /// Returns the number of events applied.
    pub async fn follow(
        &self,
        fabric: &Fabric,
        store: &ResourceStore,
        cancel: &CancelFlag,
    ) -> Result<u64, SyncError> {
        let Some(cluster) = &fabric.cluster else {
            return Ok(0);
        };
        let kinds = Self::kinds_for(fabric, store);
        let target = format!("cluster {}", cluster.server);
        let mut events = retry::call(self.policy, &target, || {
            self.client.watch_resources(cluster, &kinds)
        })
        .await?;

        let mut applied = 0;
        while let Some(event) = events.recv().await {
            if cancel.is_cancelled() {
                break;
            }
            apply_event(store, &fabric.name, event)?;
            applied += 1;
        }
        Ok(applied)
    }
}

/// Upsert every listed object, then drop actual state for objects of this
/// kind that the listing no longer contains.
pub fn apply_listing(
    store: &ResourceStore,
    fabric: &FabricName,
    kind: &str,
    objects: Vec<RemoteObject>,
) -> Result<KindOutcome, SyncError> {
    let mut outcome = KindOutcome {
        kind: kind.to_string(),
        ..KindOutcome::default()
    };
    let mut listed = BTreeSet::new();
    for object in objects {
        let key = ResourceKey::new(fabric.clone(), object.namespace.clone(), kind, object.name.clone());
        store.upsert_actual(&key, actual_state(object))?;
        listed.insert(key);
        outcome.observed += 1;
    }

    for r in store.list_by_fabric(fabric, &ResourceFilter::kind(kind)) {
        let key = r.key();
        if r.has_actual() && !listed.contains(&key) {
            store.remove_actual(&key)?;
            outcome.removed += 1;
        }
    }
    Ok(outcome)
}

pub fn apply_event(
    store: &ResourceStore,
    fabric: &FabricName,
    event: WatchEvent,
) -> Result<(), SyncError> {
    let key = ResourceKey::new(
        fabric.clone(),
        event.object.namespace.clone(),
        event.kind,
        event.object.name.clone(),
    );
    match event.event {
        WatchEventKind::Added | WatchEventKind::Modified => {
            store.upsert_actual(&key, actual_state(event.object))?;
        }
        WatchEventKind::Deleted => {
            store.remove_actual(&key)?;
        }
    }
    Ok(())
}

fn actual_state(object: RemoteObject) -> ActualState {
    ActualState {
        spec: object.spec,
        status: object.status,
        resource_version: object.resource_version,
    }
}
