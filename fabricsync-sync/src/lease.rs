//! Per-fabric lease: at most one in-progress operation per fabric, across
//! every process sharing the state directory.
//!
//! A lease is the file `<home>/.fabricsync/leases/<fabric>.lease` holding
//! a JSON [`LeaseInfo`]. Creation is atomic: the content is written to a
//! private temp file which is then hard-linked into place, and the link
//! fails if a lease already exists. An expired lease is taken over by
//! renaming it aside; the rename succeeds for exactly one contender.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use fabricsync_core::registry::state_root;
use fabricsync_core::types::FabricName;

use crate::error::{io_err, SyncError};

/// Lease content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseInfo {
    pub holder_id: String,
    pub operation_id: String,
    /// Unique per acquisition; tells two leases of one holder apart.
    pub token: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LeaseInfo {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Issues and releases fabric leases for one holder.
#[derive(Debug, Clone)]
pub struct LeaseManager {
    dir: PathBuf,
    holder_id: String,
    ttl: Duration,
}

impl LeaseManager {
    pub fn new(home: &Path, holder_id: impl Into<String>, ttl: std::time::Duration) -> Self {
        Self {
            dir: state_root(home).join("leases"),
            holder_id: holder_id.into(),
            ttl: Duration::from_std(ttl).unwrap_or_else(|_| Duration::minutes(10)),
        }
    }

    /// A holder id unique to this process.
    pub fn process_holder_id() -> String {
        format!("pid{}-{}", std::process::id(), Uuid::new_v4())
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    pub fn lease_path(&self, fabric: &FabricName) -> PathBuf {
        self.dir.join(format!("{}.lease", fabric.0))
    }

    /// Take the fabric's lease for `operation_id`, or fail with `Busy`.
    pub fn try_acquire(
        &self,
        fabric: &FabricName,
        operation_id: &str,
    ) -> Result<LeaseInfo, SyncError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| io_err(&self.dir, e))?;
        let path = self.lease_path(fabric);

        // One takeover attempt at most; a second collision means a live holder.
        for _ in 0..2 {
            let now = Utc::now();
            let info = LeaseInfo {
                holder_id: self.holder_id.clone(),
                operation_id: operation_id.to_string(),
                token: Uuid::new_v4().to_string(),
                acquired_at: now,
                expires_at: now + self.ttl,
            };
            if self.create_exclusive(&path, &info)? {
                tracing::debug!("lease {} acquired by {}", fabric, self.holder_id);
                return Ok(info);
            }

            match read_lease(&path)? {
                None => continue,
                Some(current) if current.is_expired(now) => {
                    tracing::warn!(
                        "lease on {fabric} held by {} expired at {}; taking over",
                        current.holder_id,
                        current.expires_at
                    );
                    if !self.evict(&path, &current)? {
                        return Err(busy(fabric, &current));
                    }
                }
                Some(current) => return Err(busy(fabric, &current)),
            }
        }

        let holder = read_lease(&path)?
            .map(|l| l.holder_id)
            .unwrap_or_else(|| "unknown".to_string());
        Err(SyncError::Busy {
            fabric: fabric.clone(),
            holder,
        })
    }

    /// Push the expiry out by one TTL. Fails if the lease is no longer ours
    /// or has already expired, since a contender may be taking it over.
    ///
    /// The file is claimed by moving it aside before the renewed lease is
    /// linked into place, so a lease that replaced ours is never overwritten.
    pub fn renew(&self, fabric: &FabricName, lease: &LeaseInfo) -> Result<LeaseInfo, SyncError> {
        let path = self.lease_path(fabric);
        let now = Utc::now();
        let current = match read_lease(&path)? {
            Some(current) if current.token == lease.token => current,
            Some(current) => return Err(busy(fabric, &current)),
            None => return Err(lost(fabric)),
        };
        if current.is_expired(now) {
            return Err(SyncError::Busy {
                fabric: fabric.clone(),
                holder: format!("nobody (lease expired at {})", current.expires_at),
            });
        }

        let aside = self.dir.join(format!("{}.renew", Uuid::new_v4()));
        match std::fs::rename(&path, &aside) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(lost(fabric)),
            Err(e) => return Err(io_err(&path, e)),
        }
        match read_lease(&aside)? {
            Some(moved) if moved.token == lease.token => {}
            Some(moved) => {
                let _ = std::fs::hard_link(&aside, &path);
                let _ = std::fs::remove_file(&aside);
                return Err(busy(fabric, &moved));
            }
            None => return Err(lost(fabric)),
        }

        let renewed = LeaseInfo {
            expires_at: now + self.ttl,
            ..current
        };
        let linked = self.create_exclusive(&path, &renewed);
        let _ = std::fs::remove_file(&aside);
        if linked? {
            Ok(renewed)
        } else {
            match read_lease(&path)? {
                Some(other) => Err(busy(fabric, &other)),
                None => Err(lost(fabric)),
            }
        }
    }

    /// Drop the lease if it is still ours. Returns whether anything was removed.
    pub fn release(&self, fabric: &FabricName, lease: &LeaseInfo) -> Result<bool, SyncError> {
        let path = self.lease_path(fabric);
        match read_lease(&path)? {
            Some(current) if current.token == lease.token => {
                match std::fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
                    Err(e) => return Err(io_err(&path, e)),
                }
                tracing::debug!("lease {} released by {}", fabric, self.holder_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Current holder of `fabric`, if any.
    pub fn current(&self, fabric: &FabricName) -> Result<Option<LeaseInfo>, SyncError> {
        read_lease(&self.lease_path(fabric))
    }

    fn create_exclusive(&self, path: &Path, info: &LeaseInfo) -> Result<bool, SyncError> {
        let tmp = self.dir.join(format!("{}.tmp", info.token));
        write_json(&tmp, info)?;
        let linked = std::fs::hard_link(&tmp, path);
        let _ = std::fs::remove_file(&tmp);
        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(io_err(path, e)),
        }
    }

    /// Move `expected` out of the way. `false` if someone else got there first.
    fn evict(&self, path: &Path, expected: &LeaseInfo) -> Result<bool, SyncError> {
        let aside = self.dir.join(format!("{}.stale", Uuid::new_v4()));
        match std::fs::rename(path, &aside) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(io_err(path, e)),
        }
        let moved = read_lease(&aside)?;
        if moved.as_ref().map(|l| &l.token) == Some(&expected.token) {
            let _ = std::fs::remove_file(&aside);
            return Ok(true);
        }
        // A fresh lease replaced the stale one between our read and rename:
        // put it back and back off.
        let _ = std::fs::hard_link(&aside, path);
        let _ = std::fs::remove_file(&aside);
        Ok(false)
    }
}

fn lost(fabric: &FabricName) -> SyncError {
    SyncError::Busy {
        fabric: fabric.clone(),
        holder: "nobody (lease lost)".to_string(),
    }
}

fn busy(fabric: &FabricName, current: &LeaseInfo) -> SyncError {
    SyncError::Busy {
        fabric: fabric.clone(),
        holder: format!("{} (operation {})", current.holder_id, current.operation_id),
    }
}

/// `None` if missing. Unparseable content is treated as an expired lease.
fn read_lease(path: &Path) -> Result<Option<LeaseInfo>, SyncError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_err(path, e)),
    };
    Ok(Some(serde_json::from_str(&contents).unwrap_or_else(|_| {
        LeaseInfo {
            holder_id: "corrupt".to_string(),
            operation_id: String::new(),
            token: contents.clone(),
            acquired_at: DateTime::<Utc>::MIN_UTC,
            expires_at: DateTime::<Utc>::MIN_UTC,
        }
    })))
}

fn write_json(path: &Path, info: &LeaseInfo) -> Result<(), SyncError> {
    let json = serde_json::to_string(info)?;
    std::fs::write(path, json).map_err(|e| io_err(path, e))
}
