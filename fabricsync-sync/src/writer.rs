//! Hash-gated atomic writer for the `managed/` tree.
//!
//! ## `atomic_write` protocol
//!
//! 1. Normalise line endings (caller has already rendered the content).
//! 2. SHA-256 hash the content.
//! 3. Compare with the stored hash → skip if identical and the file exists.
//! 4. Write to `<path>.fabricsync.tmp`.
//! 5. Rename to final path (atomic on POSIX).
//! 6. Update the hash store entry; the caller saves the store.

use std::path::{Path, PathBuf};

use crate::error::{io_err, SyncError};
use crate::hash_store::{self, HashStore};

/// Outcome of an individual file write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteResult {
    /// The file did not exist before.
    Created { path: PathBuf },
    /// The file existed with different content.
    Updated { path: PathBuf },
    /// Content matches the stored hash.
    Unchanged { path: PathBuf },
    /// Dry-run: the file *would* have been written.
    WouldWrite { path: PathBuf },
}

impl WriteResult {
    pub fn path(&self) -> &Path {
        match self {
            WriteResult::Created { path }
            | WriteResult::Updated { path }
            | WriteResult::Unchanged { path }
            | WriteResult::WouldWrite { path } => path,
        }
    }
}

/// Atomically write `content` to `path`, keyed in `hash_store` by `key`.
pub fn atomic_write(
    path: &Path,
    key: &str,
    content: &str,
    hash_store: &mut HashStore,
    dry_run: bool,
) -> Result<WriteResult, SyncError> {
    let normalized = content.replace("\r\n", "\n");
    let content = normalized.as_str();
    let digest = hash_store::digest_bytes(content.as_bytes());

    let existed = path.exists();
    if existed && hash_store.get(key) == Some(&digest) {
        tracing::debug!("unchanged: {}", path.display());
        return Ok(WriteResult::Unchanged {
            path: path.to_path_buf(),
        });
    }

    if dry_run {
        tracing::info!("[dry-run] would write: {}", path.display());
        return Ok(WriteResult::WouldWrite {
            path: path.to_path_buf(),
        });
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }

    let tmp = PathBuf::from(format!("{}.fabricsync.tmp", path.display()));
    std::fs::write(&tmp, content).map_err(|e| io_err(&tmp, e))?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(io_err(path, e));
    }

    hash_store.insert(key.to_string(), digest);

    tracing::info!("wrote: {}", path.display());
    Ok(if existed {
        WriteResult::Updated {
            path: path.to_path_buf(),
        }
    } else {
        WriteResult::Created {
            path: path.to_path_buf(),
        }
    })
}

/// Remove `path` and forget its hash. Missing files are not an error.
pub fn remove(path: &Path, key: &str, hash_store: &mut HashStore) -> Result<bool, SyncError> {
    hash_store.remove(key);
    match std::fs::remove_file(path) {
        Ok(()) => {
            tracing::info!("removed: {}", path.display());
            Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(io_err(path, e)),
    }
}
