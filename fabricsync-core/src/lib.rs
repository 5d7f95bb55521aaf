//! fabricsync core library: domain types, fabric registry persistence, errors.
//!
//! - [`types`]: newtypes, dual-state [`Resource`], [`SyncOperation`], [`Fabric`]
//! - [`error`]: [`RegistryError`], [`TransitionError`]
//! - [`registry`]: load / save / init of fabric records

pub mod error;
pub mod registry;
pub mod types;

pub use error::{RegistryError, TransitionError};
pub use types::{
    ArchiveStrategy, ClusterRef, ConflictPolicy, ConflictRecord, ConflictResolution,
    ConflictStatus, DriftHold, DriftReportEntry, DriftStatus, ExternalModification, Fabric,
    FabricName, FabricStatusSummary, FabricSyncStatus, FieldDiff, OperationStatus, OperationType,
    ReconcileBaseline, RepositoryRef, Resource, ResourceKey, SchedulerPriority, SyncDirection,
    SyncOperation,
};
