//! Error types for fabricsync-core.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::OperationStatus;

/// All errors that can arise from fabric registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Underlying I/O failure (file not found, permission denied, etc.).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization error (write/save path).
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// YAML parse error on load: includes file path and line context from serde_yaml.
    #[error("failed to parse fabric record at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// `dirs::home_dir()` returned `None`: cannot locate `~/.fabricsync/`.
    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,

    /// The fabric YAML file did not exist at the expected path.
    #[error("fabric not found at {path}")]
    FabricNotFound { path: PathBuf },
}

/// A [`SyncOperation`](crate::types::SyncOperation) state change that the
/// lifecycle does not allow.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid operation transition {from} -> {to}")]
pub struct TransitionError {
    pub from: OperationStatus,
    pub to: OperationStatus,
}
