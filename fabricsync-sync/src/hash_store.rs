//! Hash store: SHA-256 idempotency tracking for a fabric's files.
//!
//! Persists a `HashStoreFile` JSON document at
//! `<home>/.fabricsync/hashes/<fabric>.json`. Keys are paths relative to
//! the fabric root (`raw/…`, `managed/…`); values are hex digests of the
//! content last ingested or written there.
//! Writes use the same atomic `.tmp` + rename pattern as the registry.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use fabricsync_core::registry::state_root;
use fabricsync_core::types::FabricName;

use crate::error::{io_err, SyncError};

/// In-memory hash store: relative path → last seen SHA-256 hex digest.
pub type HashStore = HashMap<String, String>;

/// On-disk hash store payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HashStoreFile {
    pub synced_at: DateTime<Utc>,
    pub files: HashStore,
}

impl Default for HashStoreFile {
    fn default() -> Self {
        Self {
            synced_at: Utc::now(),
            files: HashMap::new(),
        }
    }
}

/// Hex SHA-256 of raw bytes.
pub fn digest_bytes(bytes: &[u8]) -> String {
    let mut h = Sha256::new();
    h.update(bytes);
    hex::encode(h.finalize())
}

/// Hex SHA-256 of a JSON value's canonical serialization.
///
/// `serde_json` keeps object keys sorted, so equal trees hash equally.
pub fn digest_value(value: &Value) -> String {
    digest_bytes(value.to_string().as_bytes())
}

/// `~/.fabricsync/hashes/<fabric>.json`
pub fn store_path_at(home: &Path, fabric: &FabricName) -> PathBuf {
    state_root(home)
        .join("hashes")
        .join(format!("{}.json", fabric.0))
}

/// Load the hash store for `fabric`. Empty if the file does not yet exist.
pub fn load_at(home: &Path, fabric: &FabricName) -> Result<HashStoreFile, SyncError> {
    let path = store_path_at(home, fabric);
    if !path.exists() {
        return Ok(HashStoreFile::default());
    }
    let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
    Ok(serde_json::from_str(&contents)?)
}

/// Save the hash store for `fabric` atomically.
pub fn save_at(home: &Path, fabric: &FabricName, store: &HashStoreFile) -> Result<(), SyncError> {
    let path = store_path_at(home, fabric);
    let Some(dir) = path.parent() else {
        return Err(io_err(
            path,
            std::io::Error::other("invalid hash store path"),
        ));
    };

    std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;

    let json = serde_json::to_string_pretty(store)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &json).map_err(|e| io_err(&tmp, e))?;
    std::fs::rename(&tmp, &path).map_err(|e| io_err(&path, e))?;
    Ok(())
}
