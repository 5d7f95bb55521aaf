//! Error types for fabricsync-sync.
//!
//! Variants follow the failure taxonomy the orchestrator reasons about;
//! [`SyncError::class`] exposes it without string matching.

use std::path::PathBuf;

use thiserror::Error;

use fabricsync_core::error::{RegistryError, TransitionError};
use fabricsync_core::types::{FabricName, ResourceKey};

/// Coarse failure class, used to decide recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed or non-CR input; skip it and carry on.
    Validation,
    /// Provider or cluster unreachable after bounded retries.
    Connectivity,
    /// Both sides diverged since the last reconciled point.
    Conflict,
    /// Another operation holds the fabric.
    Concurrency,
    /// A single record violates a store constraint.
    Constraint,
    /// Local I/O, serialization or registry failure.
    Internal,
    Cancelled,
}

/// All errors that can arise from sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid document in {path}: {reason}")]
    Validation { path: PathBuf, reason: String },

    #[error("{target} unreachable after {attempts} attempt(s): {message}")]
    Connectivity {
        target: String,
        attempts: u32,
        message: String,
    },

    /// The remote side answered but refused the request; not retried.
    #[error("{target} rejected request: {message}")]
    Rejected { target: String, message: String },

    #[error("conflict on {key}: both sides changed since last reconciliation")]
    Conflict { key: ResourceKey },

    #[error("fabric '{fabric}' is busy: operation held by {holder}")]
    Busy { fabric: FabricName, holder: String },

    #[error("constraint violated for {key}: {reason}")]
    Constraint { key: ResourceKey, reason: String },

    #[error("resource not found: {key}")]
    NotFound { key: ResourceKey },

    #[error("operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Transition(#[from] TransitionError),

    /// An error from the fabric registry.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("journal error: {0}")]
    Journal(String),
}

impl SyncError {
    pub fn class(&self) -> ErrorClass {
        match self {
            SyncError::Validation { .. } => ErrorClass::Validation,
            SyncError::Connectivity { .. } | SyncError::Rejected { .. } => {
                ErrorClass::Connectivity
            }
            SyncError::Conflict { .. } => ErrorClass::Conflict,
            SyncError::Busy { .. } => ErrorClass::Concurrency,
            SyncError::Constraint { .. } | SyncError::NotFound { .. } => ErrorClass::Constraint,
            SyncError::Cancelled => ErrorClass::Cancelled,
            SyncError::Transition(_)
            | SyncError::Registry(_)
            | SyncError::Io { .. }
            | SyncError::Json(_)
            | SyncError::Yaml(_)
            | SyncError::Journal(_) => ErrorClass::Internal,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.class() == ErrorClass::Concurrency
    }
}

/// Convenience constructor for [`SyncError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> SyncError {
    SyncError::Io {
        path: path.into(),
        source,
    }
}

/// Convenience constructor for [`SyncError::Validation`].
pub(crate) fn invalid(path: impl Into<PathBuf>, reason: impl Into<String>) -> SyncError {
    SyncError::Validation {
        path: path.into(),
        reason: reason.into(),
    }
}
