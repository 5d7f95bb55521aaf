//! In-memory dual-state resource store.
//!
//! Each resource lives in its own slot behind a `Mutex`, so writes to one
//! key serialize while writes to different keys proceed independently.
//! Every write re-runs drift detection before the lock is released; a
//! reader never observes a drift status older than the specs beside it.
//!
//! The store is snapshotted per fabric to
//! `<home>/.fabricsync/resources/<fabric>.json` with the usual
//! `.tmp` + rename pattern.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use fabricsync_core::registry::state_root;
use fabricsync_core::types::{
    DriftHold, DriftStatus, ExternalModification, FabricName, Resource, ResourceKey,
    MAX_EXTERNAL_MODIFICATIONS,
};
use fabricsync_drift::{DriftDetector, IgnoreSet};

use crate::error::{io_err, SyncError};
use crate::hash_store::digest_value;

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// The desired side of a resource as read from version control or a GUI edit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DesiredState {
    pub spec: Value,
    pub commit: Option<String>,
    pub file_path: Option<PathBuf>,
    pub managed_file_path: Option<PathBuf>,
    pub file_hash: Option<String>,
    pub api_version: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

impl DesiredState {
    pub fn new(spec: Value) -> Self {
        Self {
            spec,
            ..Self::default()
        }
    }

    pub fn with_commit(mut self, commit: impl Into<String>) -> Self {
        self.commit = Some(commit.into());
        self
    }

    pub fn with_file_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.file_path = Some(path.into());
        self
    }
}

/// The actual side of a resource as observed in the cluster.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActualState {
    pub spec: Value,
    pub status: Option<Value>,
    pub resource_version: Option<String>,
}

impl ActualState {
    pub fn new(spec: Value) -> Self {
        Self {
            spec,
            ..Self::default()
        }
    }
}

/// Optional narrowing for [`ResourceStore::list_by_fabric`].
#[derive(Debug, Clone, Default)]
pub struct ResourceFilter {
    pub kind: Option<String>,
    pub namespace: Option<String>,
    pub drift_status: Option<DriftStatus>,
    pub conflicted_only: bool,
}

impl ResourceFilter {
    pub fn kind(kind: impl Into<String>) -> Self {
        Self {
            kind: Some(kind.into()),
            ..Self::default()
        }
    }

    fn matches(&self, r: &Resource) -> bool {
        self.kind.as_ref().map_or(true, |k| *k == r.kind)
            && self.namespace.as_ref().map_or(true, |n| *n == r.namespace)
            && self.drift_status.map_or(true, |s| s == r.drift_status)
            && (!self.conflicted_only || r.autosync_halted())
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// `None` marks a record removed since the slot was looked up; the slot is
/// evicted from the map once its writer lets go.
type Slot = Arc<Mutex<Option<Resource>>>;

#[derive(Debug, Default)]
pub struct ResourceStore {
    detector: DriftDetector,
    slots: RwLock<HashMap<ResourceKey, Slot>>,
}

impl ResourceStore {
    pub fn new(detector: DriftDetector) -> Self {
        Self {
            detector,
            slots: RwLock::new(HashMap::new()),
        }
    }

    /// A store whose drift detector skips `ignore`.
    pub fn with_ignore_set(ignore: IgnoreSet) -> Self {
        Self::new(DriftDetector::new(ignore))
    }

    pub fn detector(&self) -> &DriftDetector {
        &self.detector
    }

    /// Set the desired side and recompute drift.
    pub fn upsert_desired(
        &self,
        key: &ResourceKey,
        desired: DesiredState,
    ) -> Result<Resource, SyncError> {
        let record = self.write(key, true, |r| {
            r.desired_spec = Some(desired.spec);
            r.desired_commit = desired.commit;
            r.desired_updated = Some(Utc::now());
            if desired.file_path.is_some() {
                r.desired_file_path = desired.file_path;
            }
            if desired.managed_file_path.is_some() {
                r.managed_file_path = desired.managed_file_path;
            }
            if desired.api_version.is_some() {
                r.api_version = desired.api_version;
            }
            r.file_hash = desired.file_hash;
            r.labels = desired.labels;
            r.annotations = desired.annotations;
            Ok(())
        })?;
        record.ok_or_else(|| SyncError::NotFound { key: key.clone() })
    }

    /// Set the actual side and recompute drift.
    ///
    /// When the actual spec moves away from the last reconciled point while
    /// the desired side has not, the change is logged as an external
    /// modification.
    pub fn upsert_actual(
        &self,
        key: &ResourceKey,
        actual: ActualState,
    ) -> Result<Resource, SyncError> {
        let now = Utc::now();
        let record = self.write(key, true, |r| {
            if let Some(entry) = self.external_modification(r, &actual, now) {
                tracing::info!("external modification on {key}: {:?}", entry.paths);
                r.external_modifications.push(entry);
                let excess = r
                    .external_modifications
                    .len()
                    .saturating_sub(MAX_EXTERNAL_MODIFICATIONS);
                r.external_modifications.drain(..excess);
            }
            r.actual_spec = Some(actual.spec);
            r.actual_status = actual.status;
            r.actual_resource_version = actual.resource_version;
            r.actual_updated = Some(now);
            Ok(())
        })?;
        record.ok_or_else(|| SyncError::NotFound { key: key.clone() })
    }

    /// Clear the desired side. Returns `None` once the record is gone.
    pub fn remove_desired(&self, key: &ResourceKey) -> Result<Option<Resource>, SyncError> {
        self.remove_side(key, |r| {
            r.desired_spec = None;
            r.desired_commit = None;
            r.desired_updated = Some(Utc::now());
            r.file_hash = None;
        })
    }

    /// Clear the actual side. Returns `None` once the record is gone.
    pub fn remove_actual(&self, key: &ResourceKey) -> Result<Option<Resource>, SyncError> {
        self.remove_side(key, |r| {
            r.actual_spec = None;
            r.actual_status = None;
            r.actual_resource_version = None;
            r.actual_updated = Some(Utc::now());
        })
    }

    pub fn get(&self, key: &ResourceKey) -> Result<Resource, SyncError> {
        self.slot(key, false)
            .and_then(|slot| current(&slot))
            .ok_or_else(|| SyncError::NotFound { key: key.clone() })
    }

    /// Live records of `fabric`, sorted by key.
    pub fn list_by_fabric(&self, fabric: &FabricName, filter: &ResourceFilter) -> Vec<Resource> {
        let mut slots: Vec<(ResourceKey, Slot)> = read(&self.slots)
            .iter()
            .filter(|(k, _)| k.fabric == *fabric)
            .map(|(k, s)| (k.clone(), Arc::clone(s)))
            .collect();
        slots.sort_by(|a, b| a.0.cmp(&b.0));
        slots
            .into_iter()
            .filter_map(|(_, slot)| current(&slot))
            .filter(|r| filter.matches(r))
            .collect()
    }

    /// Fabrics with at least one live record.
    pub fn fabrics(&self) -> BTreeSet<FabricName> {
        let slots: Vec<(FabricName, Slot)> = read(&self.slots)
            .iter()
            .map(|(k, s)| (k.fabric.clone(), Arc::clone(s)))
            .collect();
        slots
            .into_iter()
            .filter(|(_, slot)| lock(slot).is_some())
            .map(|(fabric, _)| fabric)
            .collect()
    }

    /// Pin the drift status while an operation is in flight.
    pub fn hold(&self, key: &ResourceKey, hold: DriftHold) -> Result<Resource, SyncError> {
        self.modify(key, |r| {
            r.drift_hold = Some(hold);
            Ok(())
        })
    }

    pub fn release_hold(&self, key: &ResourceKey) -> Result<Resource, SyncError> {
        self.modify(key, |r| {
            r.drift_hold = None;
            Ok(())
        })
    }

    /// Apply `mutate` to an existing record, then recompute drift.
    ///
    /// If `mutate` fails the record is left untouched.
    pub fn modify<F>(&self, key: &ResourceKey, mutate: F) -> Result<Resource, SyncError>
    where
        F: FnOnce(&mut Resource) -> Result<(), SyncError>,
    {
        self.write(key, false, mutate)?
            .ok_or_else(|| SyncError::NotFound { key: key.clone() })
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// Write every live record of `fabric` to its snapshot file.
    pub fn persist_at(&self, home: &Path, fabric: &FabricName) -> Result<usize, SyncError> {
        let snapshot = Snapshot {
            saved_at: Utc::now(),
            resources: self.list_by_fabric(fabric, &ResourceFilter::default()),
        };
        let path = snapshot_path_at(home, fabric);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
        }
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(&snapshot)?;
        std::fs::write(&tmp, json).map_err(|e| io_err(&tmp, e))?;
        std::fs::rename(&tmp, &path).map_err(|e| io_err(&path, e))?;
        tracing::debug!(
            "persisted {} resource(s) for {fabric}",
            snapshot.resources.len()
        );
        Ok(snapshot.resources.len())
    }

    /// Replace the in-memory records of `fabric` with its snapshot.
    ///
    /// Callers must hold the fabric's lease. A missing snapshot clears the
    /// fabric.
    pub fn load_at(&self, home: &Path, fabric: &FabricName) -> Result<usize, SyncError> {
        let resources = read_snapshot_at(home, fabric)?;
        let mut slots = write(&self.slots);
        slots.retain(|key, _| key.fabric != *fabric);
        let count = resources.len();
        for resource in resources {
            slots.insert(resource.key(), Arc::new(Mutex::new(Some(resource))));
        }
        Ok(count)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn slot(&self, key: &ResourceKey, create: bool) -> Option<Slot> {
        if let Some(slot) = read(&self.slots).get(key) {
            return Some(Arc::clone(slot));
        }
        if !create {
            return None;
        }
        Some(Arc::clone(write(&self.slots).entry(key.clone()).or_default()))
    }

    /// Run `mutate` on a copy of the record, recompute drift, then commit.
    ///
    /// Returns `None` when both sides are gone and the record was removed.
    fn write<F>(
        &self,
        key: &ResourceKey,
        create: bool,
        mutate: F,
    ) -> Result<Option<Resource>, SyncError>
    where
        F: FnOnce(&mut Resource) -> Result<(), SyncError>,
    {
        loop {
            let slot = self
                .slot(key, create)
                .ok_or_else(|| SyncError::NotFound { key: key.clone() })?;
            let mut guard = lock(&slot);
            if !self.is_mapped(key, &slot) {
                // Evicted or replaced by a snapshot load after the lookup.
                continue;
            }
            let mut next = match guard.as_ref() {
                Some(existing) => existing.clone(),
                None if create => Resource::new(key),
                None => return Err(SyncError::NotFound { key: key.clone() }),
            };

            mutate(&mut next)?;
            next.version += 1;
            next.updated_at = Utc::now();

            if self.refresh_drift(&mut next) {
                *guard = Some(next.clone());
                return Ok(Some(next));
            }
            tracing::debug!("removed {key}: neither side present");
            *guard = None;
            drop(guard);
            self.evict(key, &slot);
            return Ok(None);
        }
    }

    fn is_mapped(&self, key: &ResourceKey, slot: &Slot) -> bool {
        read(&self.slots)
            .get(key)
            .is_some_and(|mapped| Arc::ptr_eq(mapped, slot))
    }

    /// Drop `slot` from the map while it is still empty and unlocked.
    ///
    /// No caller blocks on a slot while holding the map lock, so a busy slot
    /// is left for its current writer to settle.
    fn evict(&self, key: &ResourceKey, slot: &Slot) {
        let mut slots = write(&self.slots);
        if !slots.get(key).is_some_and(|mapped| Arc::ptr_eq(mapped, slot)) {
            return;
        }
        let vacant = matches!(slot.try_lock().as_deref(), Ok(None));
        if vacant {
            slots.remove(key);
        }
    }

    fn remove_side<F>(&self, key: &ResourceKey, clear: F) -> Result<Option<Resource>, SyncError>
    where
        F: FnOnce(&mut Resource),
    {
        if self.slot(key, false).is_none() {
            return Ok(None);
        }
        match self.write(key, false, |r| {
            clear(r);
            Ok(())
        }) {
            Err(SyncError::NotFound { .. }) => Ok(None),
            other => other,
        }
    }

    /// Recompute drift fields in place. `false` means the record must go.
    fn refresh_drift(&self, r: &mut Resource) -> bool {
        match r.drift_hold {
            Some(DriftHold::CreationPending) if r.has_actual() => r.drift_hold = None,
            Some(DriftHold::DeletionPending) if !r.has_actual() => r.drift_hold = None,
            _ => {}
        }

        if let Some(hold) = r.drift_hold {
            r.drift_status = hold.status();
            r.drift_score = 1.0;
            return true;
        }

        let Some(drift) = self.detector.compute_resource(r) else {
            return false;
        };
        r.drift_status = drift.status;
        r.drift_score = drift.score;
        r.drift_details = drift.details;
        if drift.status == DriftStatus::InSync {
            r.baseline.desired_hash = r.desired_spec.as_ref().map(digest_value);
            r.baseline.actual_hash = r.actual_spec.as_ref().map(digest_value);
        }
        true
    }

    fn external_modification(
        &self,
        r: &Resource,
        incoming: &ActualState,
        now: DateTime<Utc>,
    ) -> Option<ExternalModification> {
        let desired = r.desired_spec.as_ref()?;
        let baseline_actual = r.baseline.actual_hash.as_deref()?;
        let incoming_hash = digest_value(&incoming.spec);
        let previous_hash = r.actual_spec.as_ref().map(digest_value);

        let desired_hash = digest_value(desired);
        let desired_untouched = r.baseline.desired_hash.as_deref() == Some(desired_hash.as_str());
        let moved = previous_hash.as_deref() != Some(incoming_hash.as_str())
            && incoming_hash != baseline_actual;
        if !(desired_untouched && moved) {
            return None;
        }

        let paths = self
            .detector
            .compute(Some(desired), Some(&incoming.spec))
            .map(|d| d.details.into_iter().map(|f| f.path).collect())
            .unwrap_or_default();
        Some(ExternalModification {
            detected_at: now,
            resource_version: incoming.resource_version.clone(),
            paths,
        })
    }
}

/// Both sides changed since the last reconciled point.
pub fn detect_conflict(r: &Resource) -> bool {
    if r.drift_status != DriftStatus::SpecDrift {
        return false;
    }
    let (Some(base_desired), Some(base_actual)) = (
        r.baseline.desired_hash.as_deref(),
        r.baseline.actual_hash.as_deref(),
    ) else {
        return false;
    };
    let desired_moved = r
        .desired_spec
        .as_ref()
        .map_or(false, |d| digest_value(d) != base_desired);
    let actual_moved = r
        .actual_spec
        .as_ref()
        .map_or(false, |a| digest_value(a) != base_actual);
    desired_moved && actual_moved
}

// ---------------------------------------------------------------------------
// Snapshot file
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    saved_at: DateTime<Utc>,
    resources: Vec<Resource>,
}

/// The last persisted records of `fabric`, sorted by key. No lease needed.
pub fn read_snapshot_at(home: &Path, fabric: &FabricName) -> Result<Vec<Resource>, SyncError> {
    let path = snapshot_path_at(home, fabric);
    if !path.exists() {
        return Ok(vec![]);
    }
    let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
    let mut resources = serde_json::from_str::<Snapshot>(&contents)?.resources;
    resources.sort_by_key(Resource::key);
    Ok(resources)
}

/// `~/.fabricsync/resources/<fabric>.json`
pub fn snapshot_path_at(home: &Path, fabric: &FabricName) -> PathBuf {
    state_root(home)
        .join("resources")
        .join(format!("{}.json", fabric.0))
}

fn current(slot: &Slot) -> Option<Resource> {
    lock(slot).clone()
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(l: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(l: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
