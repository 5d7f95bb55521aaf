//! # fabricsync-sync
//!
//! Dual-state resource store, file ingestion, remote collection and sync
//! orchestration.
//!
//! Call [`pipeline::local_orchestrator`] for an orchestrator wired to the
//! filesystem-backed boundaries, then [`SyncOrchestrator::run`] or
//! [`SyncOrchestrator::run_cycle`] for a tracked operation on one fabric.

pub mod archive;
pub mod boundary;
pub mod cancel;
pub mod collector;
pub mod diff;
pub mod error;
pub mod hash_store;
pub mod ingest;
pub mod journal;
pub mod layout;
pub mod lease;
pub mod local;
pub mod orchestrator;
pub mod pipeline;
pub mod report;
pub mod retry;
pub mod store;
pub mod writer;

pub use boundary::{BoundaryError, ClusterClient, VersionControl};
pub use cancel::CancelFlag;
pub use collector::{CollectionReport, RemoteStateCollector};
pub use error::{ErrorClass, SyncError};
pub use ingest::{census, Census, IngestOptions, IngestReport, Ingestor};
pub use layout::FabricLayout;
pub use orchestrator::{is_fabric_failure, OrchestratorConfig, SyncOrchestrator, SCHEDULER_INITIATOR};
pub use report::{drift_report_at, DriftReport};
pub use retry::CallPolicy;
pub use store::{ActualState, DesiredState, ResourceFilter, ResourceStore};
pub use writer::WriteResult;
