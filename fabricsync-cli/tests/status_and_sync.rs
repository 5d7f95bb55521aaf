use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::process::Command;

use assert_cmd::prelude::*;
use predicates::prelude::*;
use predicates::str::contains;
use tempfile::TempDir;

use fabricsync_core::{
    registry::{self, InitOptions},
    types::FabricName,
};

const VPC: &str = "apiVersion: vpc.githedgehog.com/v1beta1
kind: VPC
metadata:
  name: vpc-1
spec:
  mtu: 9000
";

fn fabricsync_cmd(home: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("fabricsync"));
    cmd.env("HOME", home).env("USERPROFILE", home);
    cmd
}

fn register(home: &TempDir, workspace: &TempDir, name: &str) {
    let root = workspace.path().join(name);
    fs::create_dir_all(root.join("raw")).expect("raw dir");
    fs::write(root.join("raw/vpc.yaml"), VPC).expect("drop file");
    registry::init_at(
        root,
        FabricName::from(name),
        InitOptions::default(),
        home.path(),
    )
    .expect("init fabric");
}

fn status_json(home: &Path) -> serde_json::Value {
    let assert = fabricsync_cmd(home)
        .args(["status", "--json"])
        .assert()
        .success();
    serde_json::from_slice(&assert.get_output().stdout).expect("status json")
}

#[test]
fn status_json_schema_and_sync_progress() {
    let home = TempDir::new().expect("home");
    let workspace = TempDir::new().expect("workspace");
    register(&home, &workspace, "dc1");
    register(&home, &workspace, "dc2");

    let payload = status_json(home.path());
    let top_keys: BTreeSet<String> = payload
        .as_object()
        .expect("status root object")
        .keys()
        .cloned()
        .collect();
    let expected: BTreeSet<String> = ["summary", "fabrics"].into_iter().map(str::to_string).collect();
    assert_eq!(top_keys, expected, "status root schema changed");
    assert_eq!(payload["summary"]["fabrics"], 2);
    for fabric in payload["fabrics"].as_array().expect("fabrics") {
        assert_eq!(fabric["sync_status"], "never_synced");
        assert!(fabric["last_sync"].is_null());
    }

    fabricsync_cmd(home.path())
        .args(["sync", "dc1"])
        .assert()
        .success();

    let payload = status_json(home.path());
    let dc1 = payload["fabrics"]
        .as_array()
        .expect("fabrics")
        .iter()
        .find(|f| f["fabric"] == "dc1")
        .expect("dc1");
    assert_eq!(dc1["sync_status"], "out_of_sync", "desired-only resources count as drift");
    assert_eq!(dc1["drift_count"], 1);
    assert_eq!(dc1["failure_streak"], 0);
    assert!(!dc1["last_sync"].is_null());
}

#[test]
fn sync_all_skips_disabled_fabrics() {
    let home = TempDir::new().expect("home");
    let workspace = TempDir::new().expect("workspace");
    register(&home, &workspace, "dc1");
    register(&home, &workspace, "dc2");
    registry::update_fabric_at(home.path(), &FabricName::from("dc2"), |f| {
        f.sync_enabled = false;
    })
    .expect("disable dc2");

    fabricsync_cmd(home.path())
        .args(["sync", "--all"])
        .assert()
        .success()
        .stdout(contains("'dc1'"))
        .stdout(contains("'dc2'").not());

    assert!(workspace.path().join("dc1/managed/default/VPC/vpc-1.yaml").exists());
    assert!(workspace.path().join("dc2/raw/vpc.yaml").exists());
}

#[test]
fn push_without_repository_fails_and_is_reported() {
    let home = TempDir::new().expect("home");
    let workspace = TempDir::new().expect("workspace");
    register(&home, &workspace, "dc1");

    fabricsync_cmd(home.path())
        .args(["sync", "dc1", "--direction", "push"])
        .assert()
        .failure()
        .stderr(contains("sync did not complete for: dc1"));

    let fabric = registry::load_fabric_at(home.path(), &FabricName::from("dc1")).expect("load");
    assert_eq!(fabric.failure_streak, 0, "manual failures never back off");
    assert!(fabric.last_sync_error.is_some());
}

#[test]
fn resolve_without_conflict_is_rejected() {
    let home = TempDir::new().expect("home");
    let workspace = TempDir::new().expect("workspace");
    register(&home, &workspace, "dc1");
    fabricsync_cmd(home.path())
        .args(["ingest", "dc1"])
        .assert()
        .success();

    fabricsync_cmd(home.path())
        .args(["resolve", "dc1", "VPC", "vpc-1", "--keep", "actual"])
        .assert()
        .failure();
}
