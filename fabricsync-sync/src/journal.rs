//! Operation journal: one JSON record per operation under
//! `<home>/.fabricsync/operations/<fabric>/<id>.json`.
//!
//! Records are rewritten at every transition. Once a record on disk is
//! terminal it is never rewritten again.

use std::path::{Path, PathBuf};

use fabricsync_core::registry::state_root;
use fabricsync_core::types::{FabricName, OperationStatus, SyncOperation};

use crate::error::{io_err, SyncError};

#[derive(Debug, Clone)]
pub struct OperationJournal {
    dir: PathBuf,
}

impl OperationJournal {
    pub fn new(home: &Path) -> Self {
        Self {
            dir: state_root(home).join("operations"),
        }
    }

    pub fn record_path(&self, fabric: &FabricName, id: &str) -> PathBuf {
        self.dir.join(&fabric.0).join(format!("{id}.json"))
    }

    /// Persist `op`, refusing to overwrite a terminal record.
    pub fn save(&self, op: &SyncOperation) -> Result<(), SyncError> {
        let path = self.record_path(&op.fabric, &op.id);
        if let Some(existing) = self.load(&op.fabric, &op.id)? {
            if existing.status.is_terminal() {
                return Err(SyncError::Journal(format!(
                    "operation {} is already {}",
                    op.id, existing.status
                )));
            }
        }
        let Some(dir) = path.parent() else {
            return Err(SyncError::Journal(format!("invalid record path {}", path.display())));
        };
        std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(op)?).map_err(|e| io_err(&tmp, e))?;
        std::fs::rename(&tmp, &path).map_err(|e| io_err(&path, e))?;
        Ok(())
    }

    pub fn load(&self, fabric: &FabricName, id: &str) -> Result<Option<SyncOperation>, SyncError> {
        let path = self.record_path(fabric, id);
        match std::fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(serde_json::from_str(&contents)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err(&path, e)),
        }
    }

    /// Most recent first, at most `limit` records.
    pub fn list(&self, fabric: &FabricName, limit: usize) -> Result<Vec<SyncOperation>, SyncError> {
        let dir = self.dir.join(&fabric.0);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(io_err(&dir, e)),
        };
        let mut ops = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().map_or(true, |e| e != "json") {
                continue;
            }
            let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
            match serde_json::from_str::<SyncOperation>(&contents) {
                Ok(op) => ops.push(op),
                Err(e) => tracing::warn!("skipping unreadable journal record {}: {e}", path.display()),
            }
        }
        ops.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        ops.truncate(limit);
        Ok(ops)
    }

    /// Records still `in_progress`, e.g. left behind by a crashed process.
    pub fn in_progress(&self, fabric: &FabricName) -> Result<Vec<SyncOperation>, SyncError> {
        Ok(self
            .list(fabric, usize::MAX)?
            .into_iter()
            .filter(|op| op.status == OperationStatus::InProgress)
            .collect())
    }
}
