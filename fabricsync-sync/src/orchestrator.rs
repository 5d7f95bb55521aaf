//! Sync orchestration: tracked operations over one fabric at a time.
//!
//! ## Operation lifecycle
//!
//! 1. `start_operation` journals a `pending` record, then takes the
//!    fabric's lease. Without the lease the record fails with `Busy`. With
//!    it, records a previous holder left `in_progress` are failed as
//!    abandoned. A record that cannot start is failed too.
//! 2. `execute` runs the body for the operation type, renewing the lease
//!    and checking for cancellation between steps.
//! 3. `finish` moves the record to exactly one terminal state, persists the
//!    store snapshot, folds the outcome into the fabric record and releases
//!    the lease.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use fabricsync_core::registry;
use fabricsync_core::types::{
    ConflictPolicy, ConflictRecord, ConflictResolution, ConflictStatus, DriftHold, Fabric,
    FabricName, FabricSyncStatus, OperationStatus, OperationType, RepositoryRef, Resource,
    ResourceKey, SyncDirection, SyncOperation,
};
use fabricsync_drift::{summarize, IgnoreSet};

use crate::boundary::{ClusterClient, VersionControl};
use crate::cancel::CancelFlag;
use crate::collector::RemoteStateCollector;
use crate::error::{invalid, io_err, ErrorClass, SyncError};
use crate::hash_store::{self, digest_bytes, digest_value};
use crate::ingest::{
    custom_resources, is_recognized, managed_hash_key, managed_hash_keys, CustomResource,
    IngestOptions, IngestReport, Ingestor,
};
use crate::journal::OperationJournal;
use crate::layout::{FabricLayout, KEEP_MARKER, MANAGED_DIR, RAW_DIR};
use crate::lease::{LeaseInfo, LeaseManager};
use crate::retry::{self, CallPolicy};
use crate::store::{detect_conflict, ResourceFilter, ResourceStore};
use crate::writer::{self, WriteResult};

/// `initiated_by` of operations started by the scheduler.
pub const SCHEDULER_INITIATOR: &str = "scheduler";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    pub lease_ttl: std::time::Duration,
    pub call_policy: CallPolicy,
    /// Paths excluded from drift by the store [`pipeline::local_orchestrator`] builds.
    ///
    /// [`pipeline::local_orchestrator`]: crate::pipeline::local_orchestrator
    pub ignore: IgnoreSet,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            lease_ttl: std::time::Duration::from_secs(600),
            call_policy: CallPolicy::default(),
            ignore: IgnoreSet::default(),
        }
    }
}

/// An in-progress operation holding its fabric's lease.
#[derive(Debug)]
pub struct OperationHandle {
    op: SyncOperation,
    fabric: Fabric,
    lease: LeaseInfo,
    cancel: CancelFlag,
}

impl OperationHandle {
    pub fn operation(&self) -> &SyncOperation {
        &self.op
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }
}

/// Result of a conflict pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConflictSummary {
    pub detected: u32,
    pub flagged: u32,
    pub auto_resolved: u32,
}

/// What a conflict-resolution operation should do.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ConflictWork {
    /// Detect conflicts and apply the fabric's policy.
    Policy,
    /// Close one open conflict on behalf of an operator.
    Resolve {
        key: ResourceKey,
        resolution: ConflictResolution,
        operator: String,
    },
}

pub struct SyncOrchestrator {
    home: PathBuf,
    store: Arc<ResourceStore>,
    vcs: Option<Arc<dyn VersionControl>>,
    collector: Option<RemoteStateCollector>,
    leases: LeaseManager,
    journal: OperationJournal,
    policy: CallPolicy,
    running: Mutex<HashMap<String, CancelFlag>>,
}

impl SyncOrchestrator {
    pub fn new(
        home: &Path,
        store: Arc<ResourceStore>,
        vcs: Option<Arc<dyn VersionControl>>,
        cluster: Option<Arc<dyn ClusterClient>>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            home: home.to_path_buf(),
            store,
            vcs,
            collector: cluster.map(|c| RemoteStateCollector::new(c, config.call_policy)),
            leases: LeaseManager::new(home, LeaseManager::process_holder_id(), config.lease_ttl),
            journal: OperationJournal::new(home),
            policy: config.call_policy,
            running: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<ResourceStore> {
        &self.store
    }

    pub fn journal(&self) -> &OperationJournal {
        &self.journal
    }

    pub fn leases(&self) -> &LeaseManager {
        &self.leases
    }

    // -----------------------------------------------------------------------
    // 1. Lifecycle
    // -----------------------------------------------------------------------

    /// Create a tracked operation and move it to `in_progress`.
    ///
    /// Fails with [`SyncError::Busy`] if another operation holds the fabric;
    /// the new record is then journaled as failed.
    pub async fn start_operation(
        &self,
        fabric: &FabricName,
        operation_type: OperationType,
        initiated_by: &str,
    ) -> Result<OperationHandle, SyncError> {
        let record = registry::load_fabric_at(&self.home, fabric)?;
        let mut op = SyncOperation::new(
            Uuid::new_v4().to_string(),
            fabric.clone(),
            operation_type,
            initiated_by,
        );
        self.journal.save(&op)?;

        let lease = match self.leases.try_acquire(fabric, &op.id) {
            Ok(lease) => lease,
            Err(e) => {
                op.fail(e.to_string())?;
                self.journal.save(&op)?;
                tracing::info!("{operation_type} on {fabric} refused: {e}");
                return Err(e);
            }
        };

        if let Err(e) = self.begin(&mut op, fabric) {
            tracing::warn!("{operation_type} {} on {fabric} could not start: {e}", op.id);
            let journaled = op
                .fail(e.to_string())
                .map_err(SyncError::from)
                .and_then(|()| self.journal.save(&op));
            let released = self.leases.release(fabric, &lease);
            journaled?;
            released?;
            return Err(e);
        }

        let cancel = CancelFlag::new();
        lock(&self.running).insert(op.id.clone(), cancel.clone());
        tracing::info!("{operation_type} {} started on {fabric} by {initiated_by}", op.id);
        Ok(OperationHandle {
            op,
            fabric: record,
            lease,
            cancel,
        })
    }

    fn begin(&self, op: &mut SyncOperation, fabric: &FabricName) -> Result<(), SyncError> {
        self.abandon_orphans(fabric, &op.id)?;
        op.begin()?;
        self.journal.save(op)?;
        self.store.load_at(&self.home, fabric)?;
        registry::update_fabric_at(&self.home, fabric, |f| {
            f.sync_status = FabricSyncStatus::Syncing;
        })?;
        Ok(())
    }

    /// With the lease in hand nothing else can be running on `fabric`, so any
    /// record still `in_progress` was left by a crashed or expired holder.
    fn abandon_orphans(&self, fabric: &FabricName, current: &str) -> Result<usize, SyncError> {
        let mut closed = 0;
        for mut orphan in self.journal.in_progress(fabric)? {
            if orphan.id == current {
                continue;
            }
            orphan.fail("abandoned: its holder lost the fabric lease")?;
            self.journal.save(&orphan)?;
            tracing::warn!(
                "{} {} on {fabric} was abandoned; marked failed",
                orphan.operation_type,
                orphan.id
            );
            closed += 1;
        }
        Ok(closed)
    }

    /// Run the operation's body and finish it. The returned record is terminal.
    pub async fn execute(&self, handle: OperationHandle) -> Result<SyncOperation, SyncError> {
        let work = match handle.op.operation_type {
            OperationType::ConflictResolution => Some(ConflictWork::Policy),
            _ => None,
        };
        self.execute_with(handle, work).await
    }

    async fn execute_with(
        &self,
        mut handle: OperationHandle,
        work: Option<ConflictWork>,
    ) -> Result<SyncOperation, SyncError> {
        let outcome = match handle.op.operation_type {
            OperationType::DirectoryInit => self.directory_init(&mut handle).await,
            OperationType::Ingestion => self.local_cycle(&mut handle).await,
            OperationType::GithubToGui => self.pull(&mut handle).await,
            OperationType::GuiToGithub => self.push(&mut handle).await,
            OperationType::ConflictResolution => match work.unwrap_or(ConflictWork::Policy) {
                ConflictWork::Policy => self.conflict_pass(&mut handle).map(|_| ()),
                ConflictWork::Resolve {
                    key,
                    resolution,
                    operator,
                } => self.resolve_one(&mut handle, &key, resolution, &operator),
            },
        };
        self.finish(handle, outcome)
    }

    /// `start_operation` followed by `execute`.
    pub async fn run(
        &self,
        fabric: &FabricName,
        operation_type: OperationType,
        initiated_by: &str,
    ) -> Result<SyncOperation, SyncError> {
        let handle = self.start_operation(fabric, operation_type, initiated_by).await?;
        self.execute(handle).await
    }

    /// One sync cycle: pull when a repository is configured, otherwise a
    /// local ingestion pass. The cluster is collected either way.
    pub async fn run_cycle(
        &self,
        fabric: &FabricName,
        initiated_by: &str,
    ) -> Result<SyncOperation, SyncError> {
        let record = registry::load_fabric_at(&self.home, fabric)?;
        let operation_type = if record.repository.is_some() {
            OperationType::GithubToGui
        } else {
            OperationType::Ingestion
        };
        self.run(fabric, operation_type, initiated_by).await
    }

    /// Close an open conflict with the operator's choice.
    pub async fn resolve_conflict(
        &self,
        key: &ResourceKey,
        resolution: ConflictResolution,
        operator: &str,
    ) -> Result<SyncOperation, SyncError> {
        let handle = self
            .start_operation(&key.fabric, OperationType::ConflictResolution, operator)
            .await?;
        let work = ConflictWork::Resolve {
            key: key.clone(),
            resolution,
            operator: operator.to_string(),
        };
        self.execute_with(handle, Some(work)).await
    }

    /// Request cancellation of a running operation.
    pub fn cancel(&self, operation_id: &str) -> bool {
        match lock(&self.running).get(operation_id) {
            Some(flag) => {
                flag.cancel();
                true
            }
            None => false,
        }
    }

    fn finish(
        &self,
        mut handle: OperationHandle,
        outcome: Result<(), SyncError>,
    ) -> Result<SyncOperation, SyncError> {
        let fabric = handle.fabric.name.clone();
        let transition = match &outcome {
            Ok(()) => handle.op.complete(),
            Err(SyncError::Cancelled) => handle.op.cancel(),
            Err(e) => handle.op.fail(e.to_string()),
        };

        let persisted = self.store.persist_at(&self.home, &fabric);
        let updated = self.fold_into_fabric(&handle.op, &fabric);
        let journaled = transition.map_err(SyncError::from).and_then(|()| self.journal.save(&handle.op));
        let released = self.leases.release(&fabric, &handle.lease);
        lock(&self.running).remove(&handle.op.id);

        tracing::info!(
            "{} {} on {fabric} {}{}",
            handle.op.operation_type,
            handle.op.id,
            handle.op.status,
            handle
                .op
                .error_message
                .as_deref()
                .map(|m| format!(": {m}"))
                .unwrap_or_default()
        );
        persisted?;
        updated?;
        journaled?;
        released?;
        Ok(handle.op)
    }

    fn fold_into_fabric(&self, op: &SyncOperation, fabric: &FabricName) -> Result<(), SyncError> {
        let resources = self.store.list_by_fabric(fabric, &ResourceFilter::default());
        let summary = summarize(&resources);
        let success = op.status == OperationStatus::Completed;
        let manual = op.initiated_by != SCHEDULER_INITIATOR;
        let is_cycle = matches!(
            op.operation_type,
            OperationType::Ingestion | OperationType::GithubToGui | OperationType::GuiToGithub
        );

        registry::update_fabric_at(&self.home, fabric, |f| {
            f.drift_count = summary.drift_count();
            if is_cycle && op.status != OperationStatus::Cancelled {
                f.record_cycle(success, manual, op.error_message.clone());
            }
            f.sync_status = match op.status {
                OperationStatus::Failed => {
                    f.last_sync_error = op.error_message.clone();
                    FabricSyncStatus::Error
                }
                _ if summary.drift_count() == 0 => FabricSyncStatus::InSync,
                _ => FabricSyncStatus::OutOfSync,
            };
            if success && op.commit_sha.is_some() {
                f.last_synced_commit = op.commit_sha.clone();
            }
        })?;
        Ok(())
    }

    /// Between steps: honour cancellation and keep the lease alive.
    fn checkpoint(&self, handle: &mut OperationHandle) -> Result<(), SyncError> {
        handle.cancel.check()?;
        handle.lease = self.leases.renew(&handle.fabric.name, &handle.lease)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // 2. Bodies
    // -----------------------------------------------------------------------

    /// Create the local layout and, with a repository, its keep-markers.
    async fn directory_init(&self, handle: &mut OperationHandle) -> Result<(), SyncError> {
        let created = FabricLayout::for_fabric(&handle.fabric).ensure()?;
        handle.op.files_created = count(created.len());
        handle
            .op
            .details
            .extend(created.iter().map(|p| format!("created {}", p.display())));

        if handle.fabric.repository.is_none() || self.vcs.is_none() {
            return Ok(());
        }
        let (vcs, repo) = self.repository(&handle.fabric)?;
        let target = format!("repository {}", repo.location);
        for dir in [RAW_DIR, MANAGED_DIR] {
            self.checkpoint(handle)?;
            let marker = repo_path(&repo, &format!("{dir}/{KEEP_MARKER}"));
            let present = retry::call(self.policy, &target, || vcs.read_file(&repo, &marker)).await?;
            if present.is_some() {
                continue;
            }
            let message = format!("fabricsync: initialise {dir}/");
            let sha = retry::call(self.policy, &target, || {
                vcs.write_file(&repo, &marker, "", &message)
            })
            .await?;
            handle.op.files_created += 1;
            handle.op.details.push(format!("created {marker} in repository"));
            handle.op.commit_sha = Some(sha);
        }
        Ok(())
    }

    async fn ingest(
        &self,
        handle: &mut OperationHandle,
        commit: Option<String>,
    ) -> Result<IngestReport, SyncError> {
        let home = self.home.clone();
        let fabric = handle.fabric.clone();
        let store = Arc::clone(&self.store);
        let cancel = handle.cancel.clone();
        let options = IngestOptions {
            dry_run: false,
            commit,
        };

        let report = tokio::task::spawn_blocking(move || {
            Ingestor::new(&home, &fabric, &store)
                .with_cancel(cancel)
                .run(&options)
        })
        .await
        .map_err(|e| SyncError::Journal(format!("ingestion task failed: {e}")))??;

        let op = &mut handle.op;
        op.files_processed += report.files_processed;
        op.files_created += report.managed_created;
        op.files_updated += report.managed_updated;
        op.details.push(format!(
            "ingested {} file(s): {} upsert(s), {} archived, {} document(s) skipped",
            report.files_processed,
            report.upserts,
            report.archived.len(),
            report.documents_skipped
        ));
        op.details.extend(
            report
                .failures
                .iter()
                .map(|f| format!("{}: {}", f.path.display(), f.message)),
        );
        if report.cancelled {
            return Err(SyncError::Cancelled);
        }
        Ok(report)
    }

    /// Ingest local files, then collect the cluster and run the conflict pass.
    async fn local_cycle(&self, handle: &mut OperationHandle) -> Result<(), SyncError> {
        self.ingest(handle, None).await?;
        self.checkpoint(handle)?;
        self.collect(handle).await?;
        self.conflict_pass(handle)?;
        Ok(())
    }

    /// `github_to_gui`: mirror the latest commit locally, ingest it, collect
    /// the cluster and run the conflict pass.
    async fn pull(&self, handle: &mut OperationHandle) -> Result<(), SyncError> {
        let (vcs, repo) = self.repository(&handle.fabric)?;
        let target = format!("repository {}", repo.location);
        let commit = retry::call(self.policy, &target, || vcs.latest_commit(&repo)).await?;
        handle.op.commit_sha = Some(commit.clone());
        handle.op.details.push(format!("pulling commit {commit}"));

        let layout = FabricLayout::for_fabric(&handle.fabric);
        layout.ensure()?;
        let fabric = handle.fabric.name.clone();
        let mut hashes = hash_store::load_at(&self.home, &fabric)?;

        // raw/: download files not yet ingested.
        for remote in self.remote_files(&vcs, &repo, "raw").await? {
            self.checkpoint(handle)?;
            let rel = fabric_relative(&repo, &remote);
            let Some(content) =
                retry::call(self.policy, &target, || vcs.read_file(&repo, &remote)).await?
            else {
                continue;
            };
            if hashes.files.get(&rel) == Some(&digest_bytes(content.as_bytes())) {
                continue;
            }
            let local = layout.root.join(&rel);
            if std::fs::read_to_string(&local).ok().as_deref() == Some(content.as_str()) {
                continue;
            }
            if let Some(parent) = local.parent() {
                std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
            }
            std::fs::write(&local, &content).map_err(|e| io_err(&local, e))?;
            handle.op.details.push(format!("downloaded {rel}"));
        }

        // Local desired sides not yet pushed keep their managed copy.
        let unpushed: HashSet<String> = self
            .store
            .list_by_fabric(&fabric, &ResourceFilter::default())
            .into_iter()
            .filter(|r| {
                r.has_desired()
                    && r.last_synced_commit.is_none()
                    && r.sync_direction != SyncDirection::PullOnly
            })
            .map(|r| managed_hash_key(&r.namespace, &r.kind, &r.name))
            .collect();

        // managed/: mirror the remote, remembering what it holds.
        let mut remote_digests: HashMap<String, String> = HashMap::new();
        for remote in self.remote_files(&vcs, &repo, "managed").await? {
            self.checkpoint(handle)?;
            let rel = fabric_relative(&repo, &remote);
            let Some(content) =
                retry::call(self.policy, &target, || vcs.read_file(&repo, &remote)).await?
            else {
                continue;
            };
            if let Ok((crs, _)) = custom_resources(Path::new(&rel), &content) {
                for cr in crs {
                    remote_digests.insert(
                        managed_hash_key(&cr.namespace, &cr.kind, &cr.name),
                        cr.digest(),
                    );
                }
            }
            let local = layout.root.join(&rel);
            if unpushed.contains(&rel) && local.exists() {
                handle.op.details.push(format!("kept local {rel} (not yet pushed)"));
                continue;
            }
            match writer::atomic_write(&local, &rel, &content, &mut hashes.files, false)? {
                WriteResult::Created { .. } => handle.op.files_created += 1,
                WriteResult::Updated { .. } => handle.op.files_updated += 1,
                WriteResult::Unchanged { .. } | WriteResult::WouldWrite { .. } => {}
            }
        }

        // Files we mirrored before that the remote no longer has, unless
        // they were edited locally since or never left this machine.
        for key in managed_hash_keys(&hashes) {
            if remote_digests.contains_key(&key) || unpushed.contains(&key) {
                continue;
            }
            let local = layout.root.join(&key);
            let Ok(bytes) = std::fs::read(&local) else {
                continue;
            };
            if hashes.files.get(&key) == Some(&digest_bytes(&bytes)) {
                writer::remove(&local, &key, &mut hashes.files)?;
                handle.op.files_deleted += 1;
                handle.op.details.push(format!("removed {key} (deleted upstream)"));
            }
        }
        hash_store::save_at(&self.home, &fabric, &hashes)?;

        self.checkpoint(handle)?;
        self.ingest(handle, Some(commit.clone())).await?;

        // Resources whose desired side matches the remote are synced.
        for r in self.store.list_by_fabric(&fabric, &ResourceFilter::default()) {
            let key = managed_hash_key(&r.namespace, &r.kind, &r.name);
            let matches_remote = remote_digests
                .get(&key)
                .map_or(false, |d| r.file_hash.as_deref() == Some(d.as_str()));
            if matches_remote && is_push_delta(&r) {
                self.store.modify(&r.key(), |r| {
                    let synced = r.desired_commit.clone().unwrap_or_else(|| commit.clone());
                    r.desired_commit = Some(synced.clone());
                    r.last_synced_commit = Some(synced);
                    r.reconciliation_attempts = r.reconciliation_attempts.saturating_add(1);
                    Ok(())
                })?;
            }
        }

        self.checkpoint(handle)?;
        self.collect(handle).await?;
        self.conflict_pass(handle)?;
        Ok(())
    }

    /// `gui_to_github`: commit desired-state deltas and deletions.
    async fn push(&self, handle: &mut OperationHandle) -> Result<(), SyncError> {
        let (vcs, repo) = self.repository(&handle.fabric)?;
        let target = format!("repository {}", repo.location);
        let fabric = handle.fabric.name.clone();
        let layout = FabricLayout::for_fabric(&handle.fabric);
        let mut hashes = hash_store::load_at(&self.home, &fabric)?;

        let resources = self.store.list_by_fabric(&fabric, &ResourceFilter::default());
        let deltas: Vec<&Resource> = resources.iter().filter(|r| is_push_delta(r)).collect();
        let mut pushed = 0u32;
        let mut first_error: Option<SyncError> = None;

        for r in deltas.iter().copied() {
            self.checkpoint(handle)?;
            let key = r.key();
            let Some(cr) = CustomResource::from_resource(r) else {
                continue;
            };
            let rel = managed_hash_key(&r.namespace, &r.kind, &r.name);
            let remote = repo_path(&repo, &rel);
            let yaml = cr.to_yaml()?;
            let message = format!("fabricsync: update {key}");

            let existed = retry::call(self.policy, &target, || vcs.read_file(&repo, &remote))
                .await
                .map(|c| c.is_some());
            let written = match existed {
                Ok(existed) => retry::call(self.policy, &target, || {
                    vcs.write_file(&repo, &remote, &yaml, &message)
                })
                .await
                .map(|sha| (existed, sha)),
                Err(e) => Err(e),
            };

            match written {
                Ok((existed, sha)) => {
                    if existed {
                        handle.op.files_updated += 1;
                    } else {
                        handle.op.files_created += 1;
                    }
                    let local = layout.root.join(&rel);
                    writer::atomic_write(&local, &rel, &yaml, &mut hashes.files, false)?;
                    let digest = cr.digest();
                    self.store.modify(&key, |r| {
                        r.desired_commit = Some(sha.clone());
                        r.last_synced_commit = Some(sha.clone());
                        r.sync_attempts = r.sync_attempts.saturating_add(1);
                        r.reconciliation_attempts = r.reconciliation_attempts.saturating_add(1);
                        r.last_sync_error = None;
                        r.managed_file_path = Some(local.clone());
                        r.file_hash = Some(digest);
                        if !r.has_actual() {
                            r.drift_hold = Some(DriftHold::CreationPending);
                        }
                        Ok(())
                    })?;
                    handle.op.commit_sha = Some(sha);
                    pushed += 1;
                }
                Err(e) => {
                    let message = e.to_string();
                    handle.op.details.push(format!("{key}: {message}"));
                    self.store.modify(&key, |r| {
                        r.sync_attempts = r.sync_attempts.saturating_add(1);
                        r.reconciliation_attempts = r.reconciliation_attempts.saturating_add(1);
                        r.last_sync_error = Some(message);
                        Ok(())
                    })?;
                    first_error.get_or_insert(e);
                }
            }
        }

        // Managed files we once tracked whose desired side is gone.
        let wanted: HashSet<String> = resources
            .iter()
            .filter(|r| r.has_desired())
            .map(|r| managed_hash_key(&r.namespace, &r.kind, &r.name))
            .collect();
        for rel in managed_hash_keys(&hashes) {
            if wanted.contains(&rel) || layout.root.join(&rel).exists() {
                continue;
            }
            self.checkpoint(handle)?;
            let remote = repo_path(&repo, &rel);
            let message = format!("fabricsync: delete {rel}");
            let present = retry::call(self.policy, &target, || vcs.read_file(&repo, &remote)).await;
            let deleted = match present {
                Ok(Some(_)) => retry::call(self.policy, &target, || {
                    vcs.delete_file(&repo, &remote, &message)
                })
                .await
                .map(Some),
                Ok(None) => Ok(None),
                Err(e) => Err(e),
            };
            match deleted {
                Ok(sha) => {
                    hashes.files.remove(&rel);
                    if let Some(sha) = sha {
                        handle.op.files_deleted += 1;
                        handle.op.commit_sha = Some(sha);
                    }
                    for r in resources.iter().filter(|r| {
                        r.has_actual()
                            && !r.has_desired()
                            && managed_hash_key(&r.namespace, &r.kind, &r.name) == rel
                    }) {
                        self.store.hold(&r.key(), DriftHold::DeletionPending)?;
                    }
                }
                Err(e) => {
                    handle.op.details.push(format!("{rel}: {e}"));
                    first_error.get_or_insert(e);
                }
            }
        }
        hash_store::save_at(&self.home, &fabric, &hashes)?;

        handle.op.details.push(format!(
            "pushed {pushed} of {} change(s), deleted {}",
            deltas.len(),
            handle.op.files_deleted
        ));
        match first_error {
            Some(e) if pushed == 0 && handle.op.files_deleted == 0 => Err(e),
            _ => Ok(()),
        }
    }

    async fn collect(&self, handle: &mut OperationHandle) -> Result<(), SyncError> {
        let Some(collector) = &self.collector else {
            return Ok(());
        };
        if handle.fabric.cluster.is_none() {
            return Ok(());
        }
        let report = collector
            .refresh(&handle.fabric, &self.store, &handle.cancel)
            .await?;
        if report.cancelled {
            return Err(SyncError::Cancelled);
        }
        for failed in report.failed_kinds() {
            handle.op.details.push(format!(
                "collect {}: {}",
                failed.kind,
                failed.error.as_deref().unwrap_or("failed")
            ));
        }
        if report.all_failed() {
            let server = handle
                .fabric
                .cluster
                .as_ref()
                .map(|c| c.server.clone())
                .unwrap_or_default();
            return Err(SyncError::Connectivity {
                target: format!("cluster {server}"),
                attempts: self.policy.attempts(),
                message: "no resource kind could be listed".to_string(),
            });
        }
        handle
            .op
            .details
            .push(format!("observed {} cluster object(s)", report.observed()));
        Ok(())
    }

    // -----------------------------------------------------------------------
    // 3. Conflicts
    // -----------------------------------------------------------------------

    /// Detect new conflicts and apply the fabric's policy to each.
    fn conflict_pass(&self, handle: &mut OperationHandle) -> Result<ConflictSummary, SyncError> {
        let policy = handle.fabric.conflict_policy;
        let mut summary = ConflictSummary::default();
        for r in self
            .store
            .list_by_fabric(&handle.fabric.name, &ResourceFilter::default())
        {
            if r.conflict_status == ConflictStatus::Conflicted || !detect_conflict(&r) {
                continue;
            }
            summary.detected += 1;
            let key = r.key();
            match policy {
                ConflictPolicy::Manual => {
                    self.store.modify(&key, |r| {
                        r.conflict_details.push(ConflictRecord {
                            detected_at: Utc::now(),
                            desired: r.desired_spec.clone(),
                            actual: r.actual_spec.clone(),
                            resolution: None,
                            resolved_at: None,
                            resolved_by: None,
                        });
                        r.conflict_status = ConflictStatus::Conflicted;
                        Ok(())
                    })?;
                    summary.flagged += 1;
                    tracing::warn!("conflict on {key}; autosync halted");
                }
                ConflictPolicy::DesiredWins | ConflictPolicy::ActualWins => {
                    let resolution = if policy == ConflictPolicy::DesiredWins {
                        ConflictResolution::KeepDesired
                    } else {
                        ConflictResolution::TakeActual
                    };
                    let by = format!("policy:{policy}");
                    self.store.modify(&key, |r| {
                        r.conflict_details.push(ConflictRecord {
                            detected_at: Utc::now(),
                            desired: r.desired_spec.clone(),
                            actual: r.actual_spec.clone(),
                            resolution: None,
                            resolved_at: None,
                            resolved_by: None,
                        });
                        settle(r, resolution, &by);
                        Ok(())
                    })?;
                    if resolution == ConflictResolution::TakeActual {
                        self.write_adopted(&handle.fabric, &key)?;
                    }
                    summary.auto_resolved += 1;
                    tracing::info!("conflict on {key} resolved by {by}");
                }
            }
        }
        if summary.detected > 0 {
            handle.op.details.push(format!(
                "conflicts: {} detected, {} flagged, {} auto-resolved",
                summary.detected, summary.flagged, summary.auto_resolved
            ));
        }
        Ok(summary)
    }

    fn resolve_one(
        &self,
        handle: &mut OperationHandle,
        key: &ResourceKey,
        resolution: ConflictResolution,
        operator: &str,
    ) -> Result<(), SyncError> {
        self.store.modify(key, |r| {
            if r.conflict_status != ConflictStatus::Conflicted {
                return Err(SyncError::Constraint {
                    key: key.clone(),
                    reason: "no open conflict".to_string(),
                });
            }
            settle(r, resolution, operator);
            Ok(())
        })?;
        if resolution == ConflictResolution::TakeActual {
            self.write_adopted(&handle.fabric, key)?;
        }
        handle
            .op
            .details
            .push(format!("{key}: resolved ({resolution:?}) by {operator}"));
        Ok(())
    }

    /// Write a desired side adopted from the cluster to its managed copy,
    /// so the next ingestion pass reads back what the store holds.
    fn write_adopted(&self, fabric: &Fabric, key: &ResourceKey) -> Result<(), SyncError> {
        let r = self.store.get(key)?;
        let Some(cr) = CustomResource::from_resource(&r) else {
            return Ok(());
        };
        let layout = FabricLayout::for_fabric(fabric);
        let rel = managed_hash_key(&r.namespace, &r.kind, &r.name);
        let managed = layout.root.join(&rel);
        let mut hashes = hash_store::load_at(&self.home, &fabric.name)?;
        writer::atomic_write(&managed, &rel, &cr.to_yaml()?, &mut hashes.files, false)?;
        hash_store::save_at(&self.home, &fabric.name, &hashes)?;

        let digest = cr.digest();
        self.store.modify(key, |r| {
            r.managed_file_path = Some(managed.clone());
            r.file_hash = Some(digest);
            Ok(())
        })?;
        tracing::debug!("{key}: adopted actual spec written to {}", managed.display());
        Ok(())
    }

    // -----------------------------------------------------------------------
    // 4. Helpers
    // -----------------------------------------------------------------------

    fn repository(
        &self,
        fabric: &Fabric,
    ) -> Result<(Arc<dyn VersionControl>, RepositoryRef), SyncError> {
        let repo = fabric
            .repository
            .clone()
            .ok_or_else(|| invalid(&fabric.root, "fabric has no repository configured"))?;
        let vcs = self
            .vcs
            .clone()
            .ok_or_else(|| invalid(&fabric.root, "no version-control backend available"))?;
        Ok((vcs, repo))
    }

    /// Every recognized file below `dir` (fabric-relative), as repository paths.
    async fn remote_files(
        &self,
        vcs: &Arc<dyn VersionControl>,
        repo: &RepositoryRef,
        dir: &str,
    ) -> Result<Vec<String>, SyncError> {
        let target = format!("repository {}", repo.location);
        let mut pending = vec![repo_path(repo, dir)];
        let mut files = Vec::new();
        while let Some(current) = pending.pop() {
            let entries =
                retry::call(self.policy, &target, || vcs.list_directory(repo, &current)).await?;
            for entry in entries {
                if entry.is_dir {
                    pending.push(entry.path);
                } else if is_recognized(Path::new(&entry.path)) {
                    files.push(entry.path);
                }
            }
        }
        files.sort();
        Ok(files)
    }
}

/// Close the newest open conflict record (or the one just pushed) and move
/// the resource past it.
fn settle(r: &mut Resource, resolution: ConflictResolution, by: &str) {
    let now = Utc::now();
    if let Some(record) = r
        .conflict_details
        .iter_mut()
        .rev()
        .find(|c| c.resolution.is_none())
    {
        record.resolution = Some(resolution);
        record.resolved_at = Some(now);
        record.resolved_by = Some(by.to_string());
    }
    match resolution {
        ConflictResolution::KeepDesired => {
            r.baseline.desired_hash = r.desired_spec.as_ref().map(digest_value);
            r.baseline.actual_hash = r.actual_spec.as_ref().map(digest_value);
        }
        ConflictResolution::TakeActual => {
            r.desired_spec = r.actual_spec.clone();
            r.desired_updated = Some(now);
            r.desired_commit = None;
            r.file_hash = None;
        }
    }
    // Either way the desired side must reach version control again.
    r.last_synced_commit = None;
    r.conflict_status = ConflictStatus::Resolved;
    r.reconciliation_attempts = r.reconciliation_attempts.saturating_add(1);
}

fn is_push_delta(r: &Resource) -> bool {
    r.has_desired()
        && !r.autosync_halted()
        && r.sync_direction != SyncDirection::PullOnly
        && (r.last_synced_commit.is_none() || r.desired_commit != r.last_synced_commit)
}

/// `<repo.path>/<rel>`
fn repo_path(repo: &RepositoryRef, rel: &str) -> String {
    let prefix = repo.path.trim_matches('/');
    if prefix.is_empty() {
        rel.to_string()
    } else {
        format!("{prefix}/{rel}")
    }
}

/// Inverse of [`repo_path`].
fn fabric_relative(repo: &RepositoryRef, path: &str) -> String {
    let prefix = repo.path.trim_matches('/');
    if prefix.is_empty() {
        return path.to_string();
    }
    path.strip_prefix(prefix)
        .map(|p| p.trim_start_matches('/').to_string())
        .unwrap_or_else(|| path.to_string())
}

fn count(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Whether `err` should count against a fabric's health.
pub fn is_fabric_failure(err: &SyncError) -> bool {
    !matches!(err.class(), ErrorClass::Concurrency | ErrorClass::Cancelled)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo(path: &str) -> RepositoryRef {
        RepositoryRef {
            location: "/srv/git".into(),
            branch: "main".into(),
            path: path.into(),
        }
    }

    #[test]
    fn repo_paths_roundtrip_with_prefix() {
        let r = repo("/fabrics/dc1/");
        let full = repo_path(&r, "managed/default/VPC/a.yaml");
        assert_eq!(full, "fabrics/dc1/managed/default/VPC/a.yaml");
        assert_eq!(fabric_relative(&r, &full), "managed/default/VPC/a.yaml");
        assert_eq!(repo_path(&repo(""), "raw"), "raw");
    }

    #[test]
    fn push_delta_rules() {
        let key = ResourceKey::new("dc1", "default", "VPC", "a");
        let mut r = Resource::new(&key);
        assert!(!is_push_delta(&r), "no desired side");
        r.desired_spec = Some(serde_json::json!({}));
        assert!(is_push_delta(&r), "never synced");
        r.desired_commit = Some("c1".into());
        r.last_synced_commit = Some("c1".into());
        assert!(!is_push_delta(&r));
        r.desired_commit = None;
        assert!(is_push_delta(&r), "edited since last sync");
        r.conflict_status = ConflictStatus::Conflicted;
        assert!(!is_push_delta(&r), "halted by conflict");
        r.conflict_status = ConflictStatus::Resolved;
        r.sync_direction = SyncDirection::PullOnly;
        assert!(!is_push_delta(&r));
    }

    #[test]
    fn take_actual_overwrites_desired_and_keeps_audit() {
        let key = ResourceKey::new("dc1", "default", "VPC", "a");
        let mut r = Resource::new(&key);
        r.desired_spec = Some(serde_json::json!({"mtu": 9100}));
        r.actual_spec = Some(serde_json::json!({"mtu": 1500}));
        r.conflict_status = ConflictStatus::Conflicted;
        r.conflict_details.push(ConflictRecord {
            detected_at: Utc::now(),
            desired: r.desired_spec.clone(),
            actual: r.actual_spec.clone(),
            resolution: None,
            resolved_at: None,
            resolved_by: None,
        });
        settle(&mut r, ConflictResolution::TakeActual, "alice");
        assert_eq!(r.desired_spec, r.actual_spec);
        assert_eq!(r.conflict_status, ConflictStatus::Resolved);
        let record = &r.conflict_details[0];
        assert_eq!(record.desired, Some(serde_json::json!({"mtu": 9100})));
        assert_eq!(record.resolved_by.as_deref(), Some("alice"));
    }

    #[test]
    fn busy_does_not_count_against_health() {
        let busy = SyncError::Busy {
            fabric: FabricName::from("dc1"),
            holder: "x".into(),
        };
        assert!(!is_fabric_failure(&busy));
        assert!(is_fabric_failure(&SyncError::Journal("x".into())));
    }
}
