//! Fabric registry error-message, atomic-write-safety, and init integration tests.
//! Storage: ~/.fabricsync/fabrics/<fabric>.yaml

use assert_fs::prelude::*;
use fabricsync_core::{
    registry::{self, InitOptions},
    types::{ArchiveStrategy, ConflictPolicy, FabricName, SchedulerPriority},
    Fabric, RegistryError,
};
use predicates::prelude::predicate;
use std::fs;

fn fab() -> FabricName { FabricName::from("dc1") }

// ---------------------------------------------------------------------------
// 1. Load error messages
// ---------------------------------------------------------------------------

#[test]
fn load_missing_fabric_returns_not_found() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let err = registry::load_fabric_at(home.path(), &fab()).unwrap_err();
    assert!(matches!(err, RegistryError::FabricNotFound { .. }), "got: {err}");
    assert!(err.to_string().contains("fabric not found"));
    assert!(err.to_string().contains("dc1.yaml"));
}

#[test]
fn load_corrupt_yaml_returns_parse_error_with_path() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let dir = home.path().join(".fabricsync").join("fabrics");
    fs::create_dir_all(&dir).expect("mkdir");
    fs::write(dir.join("dc1.yaml"), b": : corrupt : yaml : !!!\n  - broken: [unclosed")
        .expect("write");

    let err = registry::load_fabric_at(home.path(), &fab()).unwrap_err();
    assert!(matches!(err, RegistryError::Parse { .. }), "got: {err}");
    assert!(err.to_string().contains("dc1.yaml"), "must contain file path, got: {err}");
}

#[test]
fn list_fails_loudly_on_a_broken_record() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let dir = home.path().join(".fabricsync").join("fabrics");
    fs::create_dir_all(&dir).expect("mkdir");
    fs::write(dir.join("broken.yaml"), b"- this is a list, not a mapping\n").expect("write");

    let err = registry::list_fabrics_at(home.path()).unwrap_err();
    assert!(matches!(err, RegistryError::Parse { .. }), "got: {err}");
}

// ---------------------------------------------------------------------------
// 2. Atomic write safety
// ---------------------------------------------------------------------------

#[test]
fn save_cleans_up_tmp_file() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let fabric = Fabric::new(fab(), std::path::PathBuf::from("/srv/dc1"));
    registry::save_fabric_at(home.path(), &fabric).expect("save");

    let yaml_path = registry::fabric_path_at(home.path(), &fab());
    let tmp = yaml_path.with_file_name("dc1.yaml.tmp");
    assert!(!tmp.exists(), ".tmp must be removed after successful save");
}

#[test]
fn tmp_leftover_is_ignored_by_list() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let fabric = Fabric::new(fab(), std::path::PathBuf::from("/srv/dc1"));
    registry::save_fabric_at(home.path(), &fabric).expect("save");

    // Simulate crash: .tmp written but process died before rename
    let yaml_path = registry::fabric_path_at(home.path(), &fab());
    fs::write(yaml_path.with_file_name("dc1.yaml.tmp"), b"CRASH - INCOMPLETE WRITE")
        .expect("write crash tmp");

    let list = registry::list_fabrics_at(home.path()).expect("list");
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].name, fab());
}

// ---------------------------------------------------------------------------
// 3. Init
// ---------------------------------------------------------------------------

#[test]
fn init_creates_fabric_yaml_with_options() {
    let home = assert_fs::TempDir::new().expect("home tempdir");
    let root = assert_fs::TempDir::new().expect("root tempdir");

    let fabric = registry::init_at(
        root.path().to_path_buf(),
        fab(),
        InitOptions {
            priority: Some(SchedulerPriority::High),
            sync_interval_secs: Some(60),
            archive_strategy: Some(ArchiveStrategy::MoveToArchive),
            conflict_policy: Some(ConflictPolicy::ActualWins),
        },
        home.path(),
    )
    .expect("init");

    home.child(".fabricsync/fabrics/dc1.yaml")
        .assert(predicate::path::exists());
    assert_eq!(fabric.sync_interval_secs, 60);

    let loaded = registry::load_fabric_at(home.path(), &fab()).expect("load");
    assert_eq!(loaded.scheduler_priority, SchedulerPriority::High);
    assert_eq!(loaded.archive_strategy, ArchiveStrategy::MoveToArchive);
    assert_eq!(loaded.conflict_policy, ConflictPolicy::ActualWins);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let path = registry::fabric_path_at(home.path(), &fab());
        let mode = fs::metadata(&path).expect("meta").permissions().mode() & 0o777;
        assert_eq!(mode, 0o600, "expected 0600, got {mode:o}");
    }
}

#[test]
fn init_is_idempotent() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let root = assert_fs::TempDir::new().expect("tempdir");

    registry::init_at(
        root.path().to_path_buf(),
        fab(),
        InitOptions { priority: Some(SchedulerPriority::Critical), ..Default::default() },
        home.path(),
    )
    .expect("first init");
    registry::init_at(
        root.path().to_path_buf(),
        fab(),
        InitOptions { priority: Some(SchedulerPriority::Low), ..Default::default() },
        home.path(),
    )
    .expect("second init");

    // First wins.
    let list = registry::list_fabrics_at(home.path()).expect("list");
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].scheduler_priority, SchedulerPriority::Critical);
}

#[test]
fn list_is_sorted_and_deterministic() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let root = assert_fs::TempDir::new().expect("tempdir");

    for name in ["zeta", "alpha", "mid"] {
        registry::init_at(
            root.path().join(name),
            FabricName::from(name),
            InitOptions::default(),
            home.path(),
        )
        .expect("init");
    }

    let names: Vec<String> = registry::list_fabrics_at(home.path())
        .expect("list")
        .into_iter()
        .map(|f| f.name.0)
        .collect();
    assert_eq!(names, vec!["alpha", "mid", "zeta"]);
}
