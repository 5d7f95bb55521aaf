//! `daemon.yaml` runtime settings.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use fabricsync_drift::IgnoreSet;
use fabricsync_sync::{CallPolicy, OrchestratorConfig};

use crate::error::{io_err, DaemonError};
use crate::paths::settings_path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSettings {
    /// Seconds between scheduler ticks.
    pub tick_interval_secs: u64,
    /// Most cycles in flight at once, across all fabrics.
    pub concurrency_ceiling: usize,
    pub lease_ttl_secs: u64,
    pub call_timeout_secs: u64,
    pub call_retries: u32,
    /// Consecutive scheduled failures before priority is demoted.
    pub backoff_threshold: u32,
    /// Dotted paths never counted as drift, added to the server-managed ones.
    pub ignored_paths: Vec<String>,
    /// Keep the built-in server-managed paths (`status`, `metadata.uid`, ...).
    pub include_default_ignores: bool,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            tick_interval_secs: 30,
            concurrency_ceiling: 4,
            lease_ttl_secs: 600,
            call_timeout_secs: 30,
            call_retries: 2,
            backoff_threshold: 3,
            ignored_paths: Vec::new(),
            include_default_ignores: true,
        }
    }
}

impl DaemonSettings {
    /// Read `<home>/.fabricsync/daemon.yaml`. A missing file yields defaults.
    pub fn load_at(home: &Path) -> Result<Self, DaemonError> {
        let path = settings_path(home);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => return Err(io_err(&path, err)),
        };
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&raw).map_err(|source| DaemonError::Settings { path, source })
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs.max(1))
    }

    pub fn ignore_set(&self) -> IgnoreSet {
        let base = if self.include_default_ignores {
            IgnoreSet::default()
        } else {
            IgnoreSet::empty()
        };
        self.ignored_paths.iter().cloned().fold(base, IgnoreSet::with_path)
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            ignore: self.ignore_set(),
            lease_ttl: Duration::from_secs(self.lease_ttl_secs),
            call_policy: CallPolicy {
                timeout: Duration::from_secs(self.call_timeout_secs),
                retries: self.call_retries,
                ..CallPolicy::default()
            },
        }
    }
}
