//! External collaborators: version control and the orchestration cluster.
//!
//! Both are traits so the orchestrator can run against the local
//! implementations in [`crate::local`] or anything that speaks a real
//! provider API. Every call is wrapped by [`crate::retry::call`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use fabricsync_core::types::{ClusterRef, RepositoryRef};

/// Failure reported by a boundary implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BoundaryError {
    /// Transient; worth retrying.
    #[error("unavailable: {0}")]
    Unavailable(String),
    /// The request itself was refused; retrying will not help.
    #[error("rejected: {0}")]
    Rejected(String),
}

impl BoundaryError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, BoundaryError::Unavailable(_))
    }
}

// ---------------------------------------------------------------------------
// Version control
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoEntry {
    /// Path relative to the repository root, `/`-separated.
    pub path: String,
    pub is_dir: bool,
}

#[async_trait]
pub trait VersionControl: Send + Sync {
    /// Identifier of the head commit of `repo.branch`.
    async fn latest_commit(&self, repo: &RepositoryRef) -> Result<String, BoundaryError>;

    /// Direct children of `path`. A missing directory is empty.
    async fn list_directory(
        &self,
        repo: &RepositoryRef,
        path: &str,
    ) -> Result<Vec<RepoEntry>, BoundaryError>;

    async fn read_file(
        &self,
        repo: &RepositoryRef,
        path: &str,
    ) -> Result<Option<String>, BoundaryError>;

    /// Create or replace `path`; returns the resulting commit.
    async fn write_file(
        &self,
        repo: &RepositoryRef,
        path: &str,
        content: &str,
        message: &str,
    ) -> Result<String, BoundaryError>;

    /// Delete `path`; returns the resulting commit.
    async fn delete_file(
        &self,
        repo: &RepositoryRef,
        path: &str,
        message: &str,
    ) -> Result<String, BoundaryError>;
}

// ---------------------------------------------------------------------------
// Cluster
// ---------------------------------------------------------------------------

/// One object as reported by the cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteObject {
    pub namespace: String,
    pub name: String,
    pub spec: Value,
    #[serde(default)]
    pub status: Option<Value>,
    #[serde(default)]
    pub resource_version: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WatchEventKind {
    Added,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub event: WatchEventKind,
    /// Resource kind of `object`.
    pub kind: String,
    pub object: RemoteObject,
}

#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn list_resources(
        &self,
        cluster: &ClusterRef,
        kind: &str,
    ) -> Result<Vec<RemoteObject>, BoundaryError>;

    /// Change stream for `kinds`. Ends when the sender side is dropped.
    async fn watch_resources(
        &self,
        cluster: &ClusterRef,
        kinds: &[String],
    ) -> Result<mpsc::Receiver<WatchEvent>, BoundaryError>;
}
