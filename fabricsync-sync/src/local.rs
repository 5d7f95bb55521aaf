//! Filesystem-backed boundaries.
//!
//! [`DirectoryRepository`] treats a directory as a repository checkout whose
//! commit id is a digest of its tree. [`SnapshotCluster`] reads a directory
//! of exported cluster objects. Both are enough to run every operation
//! end to end without network access.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use fabricsync_core::types::{ClusterRef, RepositoryRef};

use crate::boundary::{
    BoundaryError, ClusterClient, RemoteObject, RepoEntry, VersionControl, WatchEvent,
    WatchEventKind,
};
use crate::hash_store::{digest_bytes, digest_value};
use crate::ingest::{discover, parse_documents, CustomResource};
use crate::layout::slash_path;

// ---------------------------------------------------------------------------
// DirectoryRepository
// ---------------------------------------------------------------------------

/// A plain directory standing in for a repository checkout.
///
/// `branch` is ignored. Writes land directly in the tree.
#[derive(Debug, Clone, Default)]
pub struct DirectoryRepository;

impl DirectoryRepository {
    pub fn new() -> Self {
        Self
    }
}

fn repo_root(repo: &RepositoryRef) -> PathBuf {
    PathBuf::from(repo.location.trim_start_matches("file://"))
}

/// Resolve `path` inside the checkout, refusing anything that escapes it.
fn resolve(repo: &RepositoryRef, path: &str) -> Result<PathBuf, BoundaryError> {
    let rel = Path::new(path.trim_start_matches('/'));
    if rel
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(BoundaryError::Rejected(format!("path escapes repository: {path}")));
    }
    Ok(repo_root(repo).join(rel))
}

fn unavailable(path: &Path, e: impl std::fmt::Display) -> BoundaryError {
    BoundaryError::Unavailable(format!("{}: {e}", path.display()))
}

/// Digest over every recognized file, in path order.
fn tree_digest(root: &Path) -> Result<String, BoundaryError> {
    if !root.is_dir() {
        return Err(BoundaryError::Unavailable(format!(
            "repository not found at {}",
            root.display()
        )));
    }
    let mut manifest = String::new();
    for file in discover(root) {
        let file = file.map_err(|e| BoundaryError::Unavailable(e.to_string()))?;
        let content = std::fs::read(&file).map_err(|e| unavailable(&file, e))?;
        let rel = slash_path(file.strip_prefix(root).unwrap_or(&file));
        manifest.push_str(&rel);
        manifest.push('\0');
        manifest.push_str(&digest_bytes(&content));
        manifest.push('\n');
    }
    let mut digest = digest_bytes(manifest.as_bytes());
    digest.truncate(40);
    Ok(digest)
}

#[async_trait]
impl VersionControl for DirectoryRepository {
    async fn latest_commit(&self, repo: &RepositoryRef) -> Result<String, BoundaryError> {
        let root = repo_root(repo);
        tokio::task::spawn_blocking(move || tree_digest(&root))
            .await
            .map_err(|e| BoundaryError::Unavailable(e.to_string()))?
    }

    async fn list_directory(
        &self,
        repo: &RepositoryRef,
        path: &str,
    ) -> Result<Vec<RepoEntry>, BoundaryError> {
        let dir = resolve(repo, path)?;
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(unavailable(&dir, e)),
        };
        let root = repo_root(repo);
        let mut out: Vec<RepoEntry> = entries
            .flatten()
            .filter(|e| !e.file_name().to_string_lossy().starts_with('.'))
            .map(|e| {
                let path = e.path();
                RepoEntry {
                    path: slash_path(path.strip_prefix(&root).unwrap_or(&path)),
                    is_dir: e.file_type().map(|t| t.is_dir()).unwrap_or(false),
                }
            })
            .collect();
        out.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(out)
    }

    async fn read_file(
        &self,
        repo: &RepositoryRef,
        path: &str,
    ) -> Result<Option<String>, BoundaryError> {
        let file = resolve(repo, path)?;
        match std::fs::read_to_string(&file) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(unavailable(&file, e)),
        }
    }

    async fn write_file(
        &self,
        repo: &RepositoryRef,
        path: &str,
        content: &str,
        message: &str,
    ) -> Result<String, BoundaryError> {
        let file = resolve(repo, path)?;
        if let Some(parent) = file.parent() {
            std::fs::create_dir_all(parent).map_err(|e| unavailable(parent, e))?;
        }
        std::fs::write(&file, content).map_err(|e| unavailable(&file, e))?;
        tracing::debug!("commit '{message}': wrote {path}");
        self.latest_commit(repo).await
    }

    async fn delete_file(
        &self,
        repo: &RepositoryRef,
        path: &str,
        message: &str,
    ) -> Result<String, BoundaryError> {
        let file = resolve(repo, path)?;
        match std::fs::remove_file(&file) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(unavailable(&file, e)),
        }
        tracing::debug!("commit '{message}': deleted {path}");
        self.latest_commit(repo).await
    }
}

// ---------------------------------------------------------------------------
// SnapshotCluster
// ---------------------------------------------------------------------------

/// A directory of exported cluster objects (`kubectl get -o yaml` output).
///
/// `server` names the directory, optionally prefixed with `file://`.
#[derive(Debug, Clone)]
pub struct SnapshotCluster {
    poll_interval: Duration,
}

impl Default for SnapshotCluster {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
        }
    }
}

impl SnapshotCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// How often `watch_resources` rescans the directory.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

fn snapshot_root(cluster: &ClusterRef) -> PathBuf {
    PathBuf::from(cluster.server.trim_start_matches("file://"))
}

/// Every object in the snapshot, grouped by kind.
fn scan(root: &Path) -> Result<HashMap<String, Vec<RemoteObject>>, BoundaryError> {
    if !root.is_dir() {
        return Err(BoundaryError::Unavailable(format!(
            "cluster snapshot not found at {}",
            root.display()
        )));
    }
    let mut by_kind: HashMap<String, Vec<RemoteObject>> = HashMap::new();
    for file in discover(root) {
        let file = file.map_err(|e| BoundaryError::Unavailable(e.to_string()))?;
        let content = std::fs::read_to_string(&file).map_err(|e| unavailable(&file, e))?;
        let Ok(docs) = parse_documents(&file, &content) else {
            tracing::warn!("skipping unreadable snapshot file {}", file.display());
            continue;
        };
        for doc in docs {
            let Some(cr) = CustomResource::from_document(&doc) else {
                continue;
            };
            let resource_version = doc
                .pointer("/metadata/resourceVersion")
                .and_then(Value::as_str)
                .map(str::to_string);
            by_kind.entry(cr.kind.clone()).or_default().push(RemoteObject {
                namespace: cr.namespace,
                name: cr.name,
                spec: cr.spec,
                status: doc.get("status").cloned(),
                resource_version,
            });
        }
    }
    Ok(by_kind)
}

#[async_trait]
impl ClusterClient for SnapshotCluster {
    async fn list_resources(
        &self,
        cluster: &ClusterRef,
        kind: &str,
    ) -> Result<Vec<RemoteObject>, BoundaryError> {
        let root = snapshot_root(cluster);
        let kind = kind.to_string();
        let mut by_kind = tokio::task::spawn_blocking(move || scan(&root))
            .await
            .map_err(|e| BoundaryError::Unavailable(e.to_string()))??;
        Ok(by_kind.remove(&kind).unwrap_or_default())
    }

    /// Polls the snapshot and emits the difference between scans.
    async fn watch_resources(
        &self,
        cluster: &ClusterRef,
        kinds: &[String],
    ) -> Result<mpsc::Receiver<WatchEvent>, BoundaryError> {
        let root = snapshot_root(cluster);
        if !root.is_dir() {
            return Err(BoundaryError::Unavailable(format!(
                "cluster snapshot not found at {}",
                root.display()
            )));
        }
        let kinds = kinds.to_vec();
        let interval = self.poll_interval;
        let (tx, rx) = mpsc::channel(256);

        tokio::spawn(async move {
            let mut known: HashMap<(String, String, String), String> = HashMap::new();
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let scan_root = root.clone();
                let Ok(Ok(by_kind)) = tokio::task::spawn_blocking(move || scan(&scan_root)).await
                else {
                    tracing::warn!("snapshot watch: scan of {} failed", root.display());
                    continue;
                };

                let mut current = HashMap::new();
                let mut events = Vec::new();
                for kind in &kinds {
                    for object in by_kind.get(kind).into_iter().flatten() {
                        let id = (kind.clone(), object.namespace.clone(), object.name.clone());
                        let digest = digest_value(&object.spec);
                        let event = match known.get(&id) {
                            None => Some(WatchEventKind::Added),
                            Some(prev) if *prev != digest => Some(WatchEventKind::Modified),
                            Some(_) => None,
                        };
                        if let Some(event) = event {
                            events.push(WatchEvent {
                                event,
                                kind: kind.clone(),
                                object: object.clone(),
                            });
                        }
                        current.insert(id, digest);
                    }
                }
                for (kind, namespace, name) in known.keys() {
                    if !current.contains_key(&(kind.clone(), namespace.clone(), name.clone())) {
                        events.push(WatchEvent {
                            event: WatchEventKind::Deleted,
                            kind: kind.clone(),
                            object: RemoteObject {
                                namespace: namespace.clone(),
                                name: name.clone(),
                                spec: Value::Null,
                                status: None,
                                resource_version: None,
                            },
                        });
                    }
                }
                known = current;

                for event in events {
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
        });
        Ok(rx)
    }
}
