//! Domain types for fabricsync.
//!
//! All path fields use `PathBuf`; open-ended CR specs use `serde_json::Value`.
//! Every status-like field is a closed enum; nothing re-derives state from strings.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TransitionError;

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// A strongly-typed fabric name (the top-level management unit).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FabricName(pub String);

impl fmt::Display for FabricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for FabricName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for FabricName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Namespace used when a CR does not name one.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Globally unique identity of a resource: `(fabric, namespace, kind, name)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    pub fabric: FabricName,
    pub namespace: String,
    pub kind: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(
        fabric: impl Into<FabricName>,
        namespace: impl Into<String>,
        kind: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            fabric: fabric.into(),
            namespace: namespace.into(),
            kind: kind.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.fabric, self.namespace, self.kind, self.name
        )
    }
}

// ---------------------------------------------------------------------------
// Drift
// ---------------------------------------------------------------------------

/// Drift classification of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DriftStatus {
    InSync,
    SpecDrift,
    #[default]
    DesiredOnly,
    ActualOnly,
    CreationPending,
    DeletionPending,
}

impl DriftStatus {
    /// Operator-held states that suppress recomputation.
    pub fn is_transient(self) -> bool {
        matches!(self, DriftStatus::CreationPending | DriftStatus::DeletionPending)
    }
}

impl fmt::Display for DriftStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DriftStatus::InSync => "in_sync",
            DriftStatus::SpecDrift => "spec_drift",
            DriftStatus::DesiredOnly => "desired_only",
            DriftStatus::ActualOnly => "actual_only",
            DriftStatus::CreationPending => "creation_pending",
            DriftStatus::DeletionPending => "deletion_pending",
        };
        f.write_str(s)
    }
}

/// A transient drift state held by the orchestrator during an in-flight operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftHold {
    CreationPending,
    DeletionPending,
}

impl DriftHold {
    pub fn status(self) -> DriftStatus {
        match self {
            DriftHold::CreationPending => DriftStatus::CreationPending,
            DriftHold::DeletionPending => DriftStatus::DeletionPending,
        }
    }
}

/// One differing leaf path between the desired and actual spec trees.
///
/// `None` means the path is absent on that side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDiff {
    pub path: String,
    pub desired: Option<Value>,
    pub actual: Option<Value>,
}

// ---------------------------------------------------------------------------
// Conflicts
// ---------------------------------------------------------------------------

/// Conflict state of a single resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    #[default]
    Clear,
    /// Both sides changed since the last reconciled point; autosync halted.
    Conflicted,
    Resolved,
}

impl fmt::Display for ConflictStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConflictStatus::Clear => "clear",
            ConflictStatus::Conflicted => "conflicted",
            ConflictStatus::Resolved => "resolved",
        };
        f.write_str(s)
    }
}

/// Per-fabric conflict policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Flag and halt autosync until an operator acts.
    #[default]
    Manual,
    /// Keep the desired side; the actual side converges on the next push.
    DesiredWins,
    /// Overwrite the desired side with the observed actual spec.
    ActualWins,
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictPolicy::Manual => write!(f, "manual"),
            ConflictPolicy::DesiredWins => write!(f, "desired_wins"),
            ConflictPolicy::ActualWins => write!(f, "actual_wins"),
        }
    }
}

/// How a conflict was (or is to be) resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    KeepDesired,
    TakeActual,
}

/// Audit record of a detected conflict. Both prior values are always kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub detected_at: DateTime<Utc>,
    pub desired: Option<Value>,
    pub actual: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<ConflictResolution>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
}

/// A change observed on the actual side that did not originate from desired state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalModification {
    pub detected_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    pub paths: Vec<String>,
}

/// Content hashes of both sides at the last reconciled point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ReconcileBaseline {
    pub desired_hash: Option<String>,
    pub actual_hash: Option<String>,
}

/// Which direction autosync may move a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    #[default]
    Bidirectional,
    /// Only pushed to version control; pulls never overwrite the desired side.
    PushOnly,
    /// Only pulled from version control; never pushed.
    PullOnly,
}

// ---------------------------------------------------------------------------
// Resource
// ---------------------------------------------------------------------------

/// Maximum number of external modification entries kept per resource.
pub const MAX_EXTERNAL_MODIFICATIONS: usize = 20;

/// The dual-state record of one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub fabric: FabricName,
    pub namespace: String,
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,

    #[serde(default)]
    pub desired_spec: Option<Value>,
    #[serde(default)]
    pub desired_commit: Option<String>,
    #[serde(default)]
    pub desired_file_path: Option<PathBuf>,
    #[serde(default)]
    pub desired_updated: Option<DateTime<Utc>>,

    #[serde(default)]
    pub actual_spec: Option<Value>,
    #[serde(default)]
    pub actual_status: Option<Value>,
    #[serde(default)]
    pub actual_resource_version: Option<String>,
    #[serde(default)]
    pub actual_updated: Option<DateTime<Utc>>,

    #[serde(default)]
    pub drift_status: DriftStatus,
    #[serde(default)]
    pub drift_details: Vec<FieldDiff>,
    #[serde(default)]
    pub drift_score: f64,
    #[serde(default)]
    pub drift_hold: Option<DriftHold>,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,

    #[serde(default)]
    pub conflict_status: ConflictStatus,
    #[serde(default)]
    pub conflict_details: Vec<ConflictRecord>,
    #[serde(default)]
    pub external_modifications: Vec<ExternalModification>,
    #[serde(default)]
    pub baseline: ReconcileBaseline,

    #[serde(default)]
    pub managed_file_path: Option<PathBuf>,
    #[serde(default)]
    pub file_hash: Option<String>,
    #[serde(default)]
    pub sync_direction: SyncDirection,

    /// Push, pull confirmation or conflict resolution passes over this record.
    #[serde(default)]
    pub reconciliation_attempts: u32,
    /// Push attempts only, successful or not.
    #[serde(default)]
    pub sync_attempts: u32,
    #[serde(default)]
    pub last_sync_error: Option<String>,
    #[serde(default)]
    pub last_synced_commit: Option<String>,

    /// Bumped on every write; used for optimistic checks by callers.
    #[serde(default)]
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Resource {
    /// A fresh record with neither side populated.
    pub fn new(key: &ResourceKey) -> Self {
        let now = Utc::now();
        Self {
            fabric: key.fabric.clone(),
            namespace: key.namespace.clone(),
            kind: key.kind.clone(),
            name: key.name.clone(),
            api_version: None,
            desired_spec: None,
            desired_commit: None,
            desired_file_path: None,
            desired_updated: None,
            actual_spec: None,
            actual_status: None,
            actual_resource_version: None,
            actual_updated: None,
            drift_status: DriftStatus::default(),
            drift_details: vec![],
            drift_score: 0.0,
            drift_hold: None,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            conflict_status: ConflictStatus::Clear,
            conflict_details: vec![],
            external_modifications: vec![],
            baseline: ReconcileBaseline::default(),
            managed_file_path: None,
            file_hash: None,
            sync_direction: SyncDirection::default(),
            reconciliation_attempts: 0,
            sync_attempts: 0,
            last_sync_error: None,
            last_synced_commit: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey {
            fabric: self.fabric.clone(),
            namespace: self.namespace.clone(),
            kind: self.kind.clone(),
            name: self.name.clone(),
        }
    }

    pub fn has_desired(&self) -> bool {
        self.desired_spec.is_some()
    }

    pub fn has_actual(&self) -> bool {
        self.actual_spec.is_some()
    }

    /// Whether autosync must leave this resource alone.
    pub fn autosync_halted(&self) -> bool {
        self.conflict_status == ConflictStatus::Conflicted
    }

    /// Projection for a presentation layer.
    pub fn drift_report_entry(&self) -> DriftReportEntry {
        DriftReportEntry {
            kind: self.kind.clone(),
            namespace: self.namespace.clone(),
            name: self.name.clone(),
            drift_status: self.drift_status,
            drift_score: self.drift_score,
            differing_fields: self.drift_details.iter().map(|d| d.path.clone()).collect(),
            conflict_status: self.conflict_status,
        }
    }
}

/// Drift report row for one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftReportEntry {
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub drift_status: DriftStatus,
    pub drift_score: f64,
    pub differing_fields: Vec<String>,
    pub conflict_status: ConflictStatus,
}

// ---------------------------------------------------------------------------
// Sync operations
// ---------------------------------------------------------------------------

/// Kind of a tracked sync operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    /// Push desired-state deltas into version control.
    GuiToGithub,
    /// Pull the latest commit and ingest it.
    GithubToGui,
    DirectoryInit,
    ConflictResolution,
    Ingestion,
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationType::GuiToGithub => "gui_to_github",
            OperationType::GithubToGui => "github_to_gui",
            OperationType::DirectoryInit => "directory_init",
            OperationType::ConflictResolution => "conflict_resolution",
            OperationType::Ingestion => "ingestion",
        };
        f.write_str(s)
    }
}

/// Lifecycle state of a [`SyncOperation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl OperationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OperationStatus::Completed | OperationStatus::Failed | OperationStatus::Cancelled
        )
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationStatus::Pending => "pending",
            OperationStatus::InProgress => "in_progress",
            OperationStatus::Completed => "completed",
            OperationStatus::Failed => "failed",
            OperationStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A tracked, named sync operation for one fabric.
///
/// `pending → in_progress → {completed | failed | cancelled}`. A pending
/// operation may also fail or be cancelled directly (it never started).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOperation {
    pub id: String,
    pub fabric: FabricName,
    pub operation_type: OperationType,
    pub status: OperationStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub details: Vec<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub files_processed: u32,
    #[serde(default)]
    pub files_created: u32,
    #[serde(default)]
    pub files_updated: u32,
    #[serde(default)]
    pub files_deleted: u32,
    #[serde(default)]
    pub commit_sha: Option<String>,
    #[serde(default)]
    pub pull_request_url: Option<String>,
    pub initiated_by: String,
}

impl SyncOperation {
    pub fn new(
        id: impl Into<String>,
        fabric: FabricName,
        operation_type: OperationType,
        initiated_by: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            fabric,
            operation_type,
            status: OperationStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            details: vec![],
            error_message: None,
            files_processed: 0,
            files_created: 0,
            files_updated: 0,
            files_deleted: 0,
            commit_sha: None,
            pull_request_url: None,
            initiated_by: initiated_by.into(),
        }
    }

    /// `pending → in_progress`.
    pub fn begin(&mut self) -> Result<(), TransitionError> {
        self.transition(OperationStatus::InProgress)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    pub fn complete(&mut self) -> Result<(), TransitionError> {
        self.transition(OperationStatus::Completed)
    }

    pub fn fail(&mut self, message: impl Into<String>) -> Result<(), TransitionError> {
        self.transition(OperationStatus::Failed)?;
        self.error_message = Some(message.into());
        Ok(())
    }

    pub fn cancel(&mut self) -> Result<(), TransitionError> {
        self.transition(OperationStatus::Cancelled)
    }

    fn transition(&mut self, to: OperationStatus) -> Result<(), TransitionError> {
        let allowed = match (self.status, to) {
            (OperationStatus::Pending, OperationStatus::InProgress) => true,
            (OperationStatus::Pending | OperationStatus::InProgress, t) if t.is_terminal() => {
                true
            }
            _ => false,
        };
        if !allowed {
            return Err(TransitionError {
                from: self.status,
                to,
            });
        }
        self.status = to;
        if to.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fabric
// ---------------------------------------------------------------------------

/// Scheduling priority. Declaration order is dispatch order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerPriority {
    Critical,
    High,
    #[default]
    Medium,
    Low,
    Maintenance,
}

impl SchedulerPriority {
    const ORDER: [SchedulerPriority; 5] = [
        SchedulerPriority::Critical,
        SchedulerPriority::High,
        SchedulerPriority::Medium,
        SchedulerPriority::Low,
        SchedulerPriority::Maintenance,
    ];

    /// Move `levels` steps towards `Maintenance`, saturating.
    pub fn demoted(self, levels: u32) -> Self {
        let idx = Self::ORDER.iter().position(|p| *p == self).unwrap_or(0);
        let target = (idx + levels as usize).min(Self::ORDER.len() - 1);
        Self::ORDER[target]
    }
}

impl fmt::Display for SchedulerPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SchedulerPriority::Critical => "critical",
            SchedulerPriority::High => "high",
            SchedulerPriority::Medium => "medium",
            SchedulerPriority::Low => "low",
            SchedulerPriority::Maintenance => "maintenance",
        };
        f.write_str(s)
    }
}

/// Fabric-level sync state shown to users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FabricSyncStatus {
    #[default]
    NeverSynced,
    InSync,
    OutOfSync,
    Syncing,
    Error,
}

impl fmt::Display for FabricSyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FabricSyncStatus::NeverSynced => "never_synced",
            FabricSyncStatus::InSync => "in_sync",
            FabricSyncStatus::OutOfSync => "out_of_sync",
            FabricSyncStatus::Syncing => "syncing",
            FabricSyncStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// What happens to a raw/ file once it has been ingested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveStrategy {
    /// `raw/x.yaml` → `raw/x.yaml.archived`
    #[default]
    RenameWithSuffix,
    /// `raw/a/x.yaml` → `archive/a/x.yaml`
    MoveToArchive,
    /// copy to `archive/a/x.<timestamp>.yaml`, then drop the raw original
    TimestampedCopy,
    /// leave the raw file in place
    None,
}

impl fmt::Display for ArchiveStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ArchiveStrategy::RenameWithSuffix => "rename_with_suffix",
            ArchiveStrategy::MoveToArchive => "move_to_archive",
            ArchiveStrategy::TimestampedCopy => "timestamped_copy",
            ArchiveStrategy::None => "none",
        };
        f.write_str(s)
    }
}

/// Version-control location of a fabric's files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryRef {
    /// Repository address (for the local backend: a checkout directory).
    pub location: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    /// Directory inside the repository holding the fabric's `raw/` and `managed/`.
    #[serde(default)]
    pub path: String,
}

fn default_branch() -> String {
    "main".to_string()
}

/// Orchestration-cluster endpoint of a fabric.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterRef {
    pub server: String,
    /// Resource kinds collected from the cluster.
    #[serde(default)]
    pub kinds: Vec<String>,
    /// Environment variable holding the bearer credentials, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials_env: Option<String>,
}

/// Starting and maximum health score.
pub const MAX_HEALTH: f64 = 1.0;

/// A managed fabric and its sync configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fabric {
    pub name: FabricName,
    /// Absolute path to the fabric root (`raw/`, `managed/`, archive).
    pub root: PathBuf,

    #[serde(default = "default_true")]
    pub sync_enabled: bool,
    #[serde(default = "default_true")]
    pub scheduler_enabled: bool,
    #[serde(default)]
    pub scheduler_priority: SchedulerPriority,
    #[serde(default = "default_interval")]
    pub sync_interval_secs: u64,
    #[serde(default)]
    pub archive_strategy: ArchiveStrategy,
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<RepositoryRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<ClusterRef>,

    /// Last successful cycle.
    #[serde(default)]
    pub last_sync: Option<DateTime<Utc>>,
    /// Last cycle that ran to an outcome, successful or not.
    #[serde(default)]
    pub last_attempt: Option<DateTime<Utc>>,
    #[serde(default = "default_health")]
    pub sync_health_score: f64,
    #[serde(default)]
    pub failure_streak: u32,
    #[serde(default)]
    pub drift_count: u32,
    #[serde(default)]
    pub sync_status: FabricSyncStatus,
    #[serde(default)]
    pub last_sync_error: Option<String>,
    #[serde(default)]
    pub last_synced_commit: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

fn default_interval() -> u64 {
    300
}

fn default_health() -> f64 {
    MAX_HEALTH
}

impl Fabric {
    pub fn new(name: impl Into<FabricName>, root: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            root,
            sync_enabled: true,
            scheduler_enabled: true,
            scheduler_priority: SchedulerPriority::default(),
            sync_interval_secs: default_interval(),
            archive_strategy: ArchiveStrategy::default(),
            conflict_policy: ConflictPolicy::default(),
            repository: None,
            cluster: None,
            last_sync: None,
            last_attempt: None,
            sync_health_score: MAX_HEALTH,
            failure_streak: 0,
            drift_count: 0,
            sync_status: FabricSyncStatus::NeverSynced,
            last_sync_error: None,
            last_synced_commit: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn sync_interval(&self) -> Duration {
        i64::try_from(self.sync_interval_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .unwrap_or(Duration::MAX)
    }

    /// Whether the scheduler may consider this fabric at all.
    pub fn is_schedulable(&self) -> bool {
        self.scheduler_enabled && self.sync_enabled
    }

    /// The later of the last success and the last attempt.
    pub fn last_cycle(&self) -> Option<DateTime<Utc>> {
        self.last_sync.max(self.last_attempt)
    }

    /// Due when `sync_interval` has passed since the last cycle, or
    /// immediately if none ever ran. A failed cycle waits a full interval
    /// like a successful one.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.last_cycle() {
            None => true,
            Some(last) => now.signed_duration_since(last) >= self.sync_interval(),
        }
    }

    /// Priority after auto back-off: one level down per failure at or past
    /// `threshold`.
    pub fn effective_priority(&self, threshold: u32) -> SchedulerPriority {
        if threshold == 0 || self.failure_streak < threshold {
            return self.scheduler_priority;
        }
        self.scheduler_priority
            .demoted(self.failure_streak - threshold + 1)
    }

    /// Fold the outcome of one sync cycle into health and back-off state.
    ///
    /// A manual cycle always clears the back-off, whatever its outcome.
    pub fn record_cycle(&mut self, success: bool, manual: bool, error: Option<String>) {
        let now = Utc::now();
        if success {
            self.sync_health_score += (MAX_HEALTH - self.sync_health_score) * 0.5;
            self.failure_streak = 0;
            self.last_sync_error = None;
            self.last_sync = Some(now);
        } else {
            self.sync_health_score *= 0.5;
            self.failure_streak = if manual { 0 } else { self.failure_streak + 1 };
            self.last_sync_error = error;
            self.sync_status = FabricSyncStatus::Error;
        }
        self.last_attempt = Some(now);
        self.sync_health_score = self.sync_health_score.clamp(0.0, MAX_HEALTH);
        self.updated_at = now;
    }

    pub fn status_summary(&self) -> FabricStatusSummary {
        FabricStatusSummary {
            fabric: self.name.clone(),
            sync_status: self.sync_status,
            last_sync: self.last_sync,
            drift_count: self.drift_count,
            sync_health_score: self.sync_health_score,
        }
    }
}

/// Per-fabric status exposed to other components.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FabricStatusSummary {
    pub fabric: FabricName,
    pub sync_status: FabricSyncStatus,
    pub last_sync: Option<DateTime<Utc>>,
    pub drift_count: u32,
    pub sync_health_score: f64,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn fabric() -> Fabric {
        Fabric::new("dc1", PathBuf::from("/srv/fabrics/dc1"))
    }

    #[test]
    fn resource_key_display() {
        let key = ResourceKey::new("dc1", "default", "VPC", "vpc-a");
        assert_eq!(key.to_string(), "dc1/default/VPC/vpc-a");
    }

    #[test]
    fn drift_status_serializes_snake_case() {
        let yaml = serde_yaml::to_string(&DriftStatus::CreationPending).expect("serialize");
        assert_eq!(yaml.trim(), "creation_pending");
        assert!(DriftStatus::DeletionPending.is_transient());
        assert!(!DriftStatus::SpecDrift.is_transient());
    }

    #[test]
    fn operation_lifecycle_happy_path() {
        let mut op = SyncOperation::new(
            "op-1",
            FabricName::from("dc1"),
            OperationType::Ingestion,
            "tester",
        );
        op.begin().expect("begin");
        assert!(op.started_at.is_some());
        op.complete().expect("complete");
        assert_eq!(op.status, OperationStatus::Completed);
        assert!(op.completed_at.is_some());
    }

    #[test]
    fn terminal_operation_is_immutable() {
        let mut op = SyncOperation::new(
            "op-1",
            FabricName::from("dc1"),
            OperationType::GuiToGithub,
            "tester",
        );
        op.begin().expect("begin");
        op.fail("boom").expect("fail");
        let err = op.complete().unwrap_err();
        assert_eq!(err.from, OperationStatus::Failed);
        assert_eq!(err.to, OperationStatus::Completed);
        assert!(op.begin().is_err());
        assert_eq!(op.error_message.as_deref(), Some("boom"));
    }

    #[test]
    fn in_progress_cannot_begin_twice() {
        let mut op = SyncOperation::new(
            "op-2",
            FabricName::from("dc1"),
            OperationType::GithubToGui,
            "tester",
        );
        op.begin().expect("begin");
        assert!(op.begin().is_err());
    }

    #[test]
    fn priority_demotion_saturates() {
        assert_eq!(SchedulerPriority::High.demoted(1), SchedulerPriority::Medium);
        assert_eq!(
            SchedulerPriority::Low.demoted(10),
            SchedulerPriority::Maintenance
        );
        assert!(SchedulerPriority::Critical < SchedulerPriority::Maintenance);
    }

    #[test]
    fn never_synced_fabric_is_due() {
        assert!(fabric().is_due(Utc::now()));
    }

    #[test]
    fn failure_streak_demotes_until_success() {
        let mut f = fabric();
        f.scheduler_priority = SchedulerPriority::High;
        for _ in 0..3 {
            f.record_cycle(false, false, Some("cluster unreachable".into()));
        }
        assert_eq!(f.failure_streak, 3);
        assert_eq!(f.effective_priority(3), SchedulerPriority::Medium);
        assert!(f.sync_health_score < 0.2);

        f.record_cycle(true, false, None);
        assert_eq!(f.failure_streak, 0);
        assert_eq!(f.effective_priority(3), SchedulerPriority::High);
        assert!(f.last_sync_error.is_none());
    }

    #[test]
    fn failed_cycle_waits_a_full_interval() {
        let mut f = fabric();
        f.sync_interval_secs = 60;
        f.record_cycle(false, false, Some("cluster unreachable".into()));

        assert!(f.last_sync.is_none());
        let attempted = f.last_attempt.expect("attempt recorded");
        assert!(!f.is_due(attempted + Duration::seconds(30)));
        assert!(f.is_due(attempted + Duration::seconds(60)));
    }

    #[test]
    fn success_after_failure_moves_both_timestamps() {
        let mut f = fabric();
        f.record_cycle(false, false, Some("boom".into()));
        f.record_cycle(true, false, None);
        assert_eq!(f.last_sync, f.last_attempt);
        assert_eq!(f.last_cycle(), f.last_sync);
    }

    #[test]
    fn manual_cycle_clears_backoff_even_on_failure() {
        let mut f = fabric();
        f.failure_streak = 5;
        f.record_cycle(false, true, Some("boom".into()));
        assert_eq!(f.failure_streak, 0);
        assert_eq!(f.sync_status, FabricSyncStatus::Error);
    }

    #[test]
    fn fabric_yaml_defaults_fill_missing_fields() {
        let yaml = "name: dc1\nroot: /srv/dc1\ncreated_at: 2024-01-01T00:00:00Z\nupdated_at: 2024-01-01T00:00:00Z\n";
        let f: Fabric = serde_yaml::from_str(yaml).expect("deserialize");
        assert!(f.sync_enabled);
        assert_eq!(f.sync_interval_secs, 300);
        assert_eq!(f.sync_health_score, MAX_HEALTH);
        assert_eq!(f.conflict_policy, ConflictPolicy::Manual);
    }
}
