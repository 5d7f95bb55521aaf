//! Fabric registry: one YAML record per fabric.
//!
//! # Storage layout
//!
//! ```text
//! ~/.fabricsync/
//!   fabrics/
//!     <fabric_name>.yaml   (one file per fabric: mode 0600)
//! ```
//!
//! # API pattern
//!
//! Every function has two forms:
//! - `fn_at(home: &Path, …)`: explicit home; used in tests with `TempDir`
//! - `fn(…)`: derives home from `dirs::home_dir()`, delegates to `_at`
//!
//! Tests must NEVER call the no-arg wrappers; always use `_at`.

use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::error::RegistryError;
use crate::types::{ArchiveStrategy, ConflictPolicy, Fabric, FabricName, SchedulerPriority};

/// Name of the state directory under the home directory.
pub const STATE_DIR: &str = ".fabricsync";

// ---------------------------------------------------------------------------
// 1. Path helpers
// ---------------------------------------------------------------------------

/// `<home>/.fabricsync/`: pure, no I/O.
pub fn state_root(home: &Path) -> PathBuf {
    home.join(STATE_DIR)
}

/// `<home>/.fabricsync/fabrics/`
///
/// Creates the directory (mode `0700`) if it does not yet exist.
pub fn fabrics_dir_at(home: &Path) -> Result<PathBuf, RegistryError> {
    let dir = state_root(home).join("fabrics");
    if !dir.exists() {
        std::fs::create_dir_all(&dir)?;
        set_dir_permissions(&dir)?;
    }
    Ok(dir)
}

/// `<home>/.fabricsync/fabrics/<fabric>.yaml`: pure, no I/O.
pub fn fabric_path_at(home: &Path, fabric: &FabricName) -> PathBuf {
    state_root(home)
        .join("fabrics")
        .join(format!("{}.yaml", fabric.0))
}

// ---------------------------------------------------------------------------
// 2. Load
// ---------------------------------------------------------------------------

/// Load a single fabric from `<home>/.fabricsync/fabrics/<fabric>.yaml`.
///
/// Returns `RegistryError::FabricNotFound` if absent,
/// `RegistryError::Parse` (with path + line context) if malformed YAML.
pub fn load_fabric_at(home: &Path, fabric: &FabricName) -> Result<Fabric, RegistryError> {
    let path = fabric_path_at(home, fabric);
    if !path.exists() {
        return Err(RegistryError::FabricNotFound { path });
    }
    let contents = std::fs::read_to_string(&path)?;
    serde_yaml::from_str(&contents).map_err(|e| RegistryError::Parse { path, source: e })
}

/// `load_fabric_at` convenience wrapper.
pub fn load_fabric(fabric: &FabricName) -> Result<Fabric, RegistryError> {
    load_fabric_at(&home()?, fabric)
}

/// All registered fabrics, sorted by name. Skips `*.tmp` leftovers.
pub fn list_fabrics_at(home: &Path) -> Result<Vec<Fabric>, RegistryError> {
    let dir = state_root(home).join("fabrics");
    if !dir.exists() {
        return Ok(vec![]);
    }

    let mut entries: Vec<_> = std::fs::read_dir(&dir)?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .collect();
    entries.sort_by_key(|e| e.file_name());

    let mut result = Vec::new();
    for entry in entries {
        let fname = entry.file_name();
        let name = fname.to_string_lossy();
        if !name.ends_with(".yaml") {
            continue;
        }
        let contents = std::fs::read_to_string(entry.path())?;
        let fabric: Fabric = serde_yaml::from_str(&contents).map_err(|e| RegistryError::Parse {
            path: entry.path(),
            source: e,
        })?;
        result.push(fabric);
    }
    Ok(result)
}

/// `list_fabrics_at` convenience wrapper.
pub fn list_fabrics() -> Result<Vec<Fabric>, RegistryError> {
    list_fabrics_at(&home()?)
}

// ---------------------------------------------------------------------------
// 3. Save (atomic)
// ---------------------------------------------------------------------------

/// Atomically save a fabric to `<home>/.fabricsync/fabrics/<fabric>.yaml`.
///
/// Write flow: serialize → `.yaml.tmp` sibling → `chmod 0600` → `rename`.
pub fn save_fabric_at(home: &Path, fabric: &Fabric) -> Result<(), RegistryError> {
    fabrics_dir_at(home)?;
    let path = fabric_path_at(home, &fabric.name);
    let tmp_path = path.with_file_name(format!("{}.yaml.tmp", fabric.name.0));

    let yaml = serde_yaml::to_string(fabric)?;
    std::fs::write(&tmp_path, yaml)?;
    set_file_permissions(&tmp_path)?;
    std::fs::rename(&tmp_path, &path)?;
    Ok(())
}

/// `save_fabric_at` convenience wrapper.
pub fn save_fabric(fabric: &Fabric) -> Result<(), RegistryError> {
    save_fabric_at(&home()?, fabric)
}

/// Load, mutate, stamp `updated_at`, save. Returns the saved record.
pub fn update_fabric_at<F>(
    home: &Path,
    fabric: &FabricName,
    mutate: F,
) -> Result<Fabric, RegistryError>
where
    F: FnOnce(&mut Fabric),
{
    let mut record = load_fabric_at(home, fabric)?;
    mutate(&mut record);
    record.updated_at = Utc::now();
    save_fabric_at(home, &record)?;
    Ok(record)
}

// ---------------------------------------------------------------------------
// 4. Init
// ---------------------------------------------------------------------------

/// Options accepted by [`init_at`]; `None` keeps the record default.
#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    pub priority: Option<SchedulerPriority>,
    pub sync_interval_secs: Option<u64>,
    pub archive_strategy: Option<ArchiveStrategy>,
    pub conflict_policy: Option<ConflictPolicy>,
}

/// Register the fabric rooted at `root` under `name`.
///
/// Idempotent: if the record already exists, loads and returns it unchanged.
pub fn init_at(
    root: PathBuf,
    name: FabricName,
    options: InitOptions,
    home: &Path,
) -> Result<Fabric, RegistryError> {
    let path = fabric_path_at(home, &name);
    if path.exists() {
        return load_fabric_at(home, &name);
    }

    let mut fabric = Fabric::new(name, root);
    if let Some(priority) = options.priority {
        fabric.scheduler_priority = priority;
    }
    if let Some(secs) = options.sync_interval_secs {
        fabric.sync_interval_secs = secs;
    }
    if let Some(strategy) = options.archive_strategy {
        fabric.archive_strategy = strategy;
    }
    if let Some(policy) = options.conflict_policy {
        fabric.conflict_policy = policy;
    }

    save_fabric_at(home, &fabric)?;
    Ok(fabric)
}

/// `init_at` convenience wrapper.
pub fn init(root: PathBuf, name: FabricName, options: InitOptions) -> Result<Fabric, RegistryError> {
    init_at(root, name, options, &home()?)
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

/// The current user's home directory.
pub fn home() -> Result<PathBuf, RegistryError> {
    dirs::home_dir().ok_or(RegistryError::HomeNotFound)
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), RegistryError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
    Ok(())
}
#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), RegistryError> {
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), RegistryError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}
#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), RegistryError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
