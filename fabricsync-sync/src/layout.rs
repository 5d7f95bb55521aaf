//! On-disk layout of a fabric root.
//!
//! ```text
//! <root>/
//!   raw/       user-dropped files awaiting ingestion
//!   managed/   normalized CRs, one file per resource
//!   archive/   ingested raw files (strategy dependent)
//! ```

use std::path::{Component, Path, PathBuf};

use fabricsync_core::types::Fabric;

use crate::error::{io_err, SyncError};

pub const RAW_DIR: &str = "raw";
pub const MANAGED_DIR: &str = "managed";
pub const ARCHIVE_DIR: &str = "archive";

/// Placeholder kept in otherwise empty directories so they survive in git.
pub const KEEP_MARKER: &str = ".gitkeep";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FabricLayout {
    pub root: PathBuf,
    pub raw: PathBuf,
    pub managed: PathBuf,
    pub archive: PathBuf,
}

impl FabricLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            raw: root.join(RAW_DIR),
            managed: root.join(MANAGED_DIR),
            archive: root.join(ARCHIVE_DIR),
            root,
        }
    }

    pub fn for_fabric(fabric: &Fabric) -> Self {
        Self::new(fabric.root.clone())
    }

    /// Create the directory skeleton. Idempotent; returns what was created.
    pub fn ensure(&self) -> Result<Vec<PathBuf>, SyncError> {
        let mut created = Vec::new();
        for dir in [&self.raw, &self.managed, &self.archive] {
            if !dir.is_dir() {
                std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
                created.push(dir.clone());
            }
            let marker = dir.join(KEEP_MARKER);
            if !marker.exists() {
                std::fs::write(&marker, "").map_err(|e| io_err(&marker, e))?;
                created.push(marker);
            }
        }
        Ok(created)
    }

    /// `path` relative to the fabric root, `/`-separated.
    ///
    /// Paths outside the root are returned as given.
    pub fn relative(&self, path: &Path) -> String {
        let rel = path.strip_prefix(&self.root).unwrap_or(path);
        slash_path(rel)
    }
}

/// Join path components with `/` regardless of platform.
pub fn slash_path(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}
