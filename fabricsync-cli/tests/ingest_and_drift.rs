use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use assert_cmd::prelude::*;
use predicates::str::contains;
use tempfile::TempDir;

const VPC: &str = "apiVersion: vpc.githedgehog.com/v1beta1
kind: VPC
metadata:
  name: vpc-1
spec:
  mtu: 9000
  vlan: 1000
";

const VPC_LIVE: &str = "apiVersion: vpc.githedgehog.com/v1beta1
kind: VPC
metadata:
  name: vpc-1
  namespace: default
spec:
  mtu: 1500
  vlan: 1000
";

fn fabricsync_cmd(home: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("fabricsync"));
    cmd.env("HOME", home).env("USERPROFILE", home);
    cmd
}

fn init_fabric(home: &TempDir, workspace: &TempDir, name: &str, extra: &[&str]) -> PathBuf {
    let root = workspace.path().join(name);
    fabricsync_cmd(home.path())
        .arg("init")
        .arg(&root)
        .args(["--name", name])
        .args(extra)
        .assert()
        .success()
        .stdout(contains(format!("Registered fabric '{name}'")));
    root
}

#[test]
fn init_creates_layout() {
    let home = TempDir::new().expect("home");
    let workspace = TempDir::new().expect("workspace");
    let root = init_fabric(&home, &workspace, "dc1", &[]);

    assert!(root.join("raw").is_dir());
    assert!(root.join("managed").is_dir());
    assert!(home.path().join(".fabricsync/fabrics/dc1.yaml").exists());

    fabricsync_cmd(home.path())
        .args(["fabric", "list"])
        .assert()
        .success()
        .stdout(contains("dc1"));
}

#[test]
fn dry_run_ingest_reports_and_writes_nothing() {
    let home = TempDir::new().expect("home");
    let workspace = TempDir::new().expect("workspace");
    let root = init_fabric(&home, &workspace, "dc1", &[]);
    fs::write(root.join("raw/vpc.yaml"), VPC).expect("drop file");

    fabricsync_cmd(home.path())
        .args(["ingest", "dc1", "--dry-run"])
        .assert()
        .success()
        .stdout(contains("[dry-run]"))
        .stdout(contains("1 to create"));

    assert!(root.join("raw/vpc.yaml").exists(), "dry run must not archive");
    let managed: Vec<_> = fs::read_dir(root.join("managed"))
        .expect("managed dir")
        .collect();
    assert!(managed.is_empty(), "dry run must not write managed files");
    assert!(!home.path().join(".fabricsync/resources/dc1.json").exists());
}

#[test]
fn ingest_promotes_raw_file_and_census_counts_it_once() {
    let home = TempDir::new().expect("home");
    let workspace = TempDir::new().expect("workspace");
    let root = init_fabric(&home, &workspace, "dc1", &[]);
    fs::write(root.join("raw/vpc.yaml"), VPC).expect("drop file");

    fabricsync_cmd(home.path())
        .args(["ingest", "dc1"])
        .assert()
        .success()
        .stdout(contains("completed"));

    assert!(root.join("managed/default/VPC/vpc-1.yaml").exists());
    assert!(root.join("raw/vpc.yaml.archived").exists());
    assert!(!root.join("raw/vpc.yaml").exists());

    let assert = fabricsync_cmd(home.path())
        .args(["census", "dc1", "--json"])
        .assert()
        .success();
    let census: serde_json::Value =
        serde_json::from_slice(&assert.get_output().stdout).expect("census json");
    assert_eq!(census["managed"], 1);
    assert_eq!(census["unique"], 1);
}

#[test]
fn drift_report_and_diff_show_live_mismatch() {
    let home = TempDir::new().expect("home");
    let workspace = TempDir::new().expect("workspace");
    let live = workspace.path().join("live");
    fs::create_dir_all(&live).expect("live dir");
    fs::write(live.join("vpc.yaml"), VPC_LIVE).expect("live object");

    let cluster = format!("file://{}", live.display());
    let root = init_fabric(
        &home,
        &workspace,
        "dc1",
        &["--cluster", &cluster, "--kinds", "VPC"],
    );
    fs::write(root.join("raw/vpc.yaml"), VPC).expect("drop file");

    fabricsync_cmd(home.path())
        .args(["sync", "dc1"])
        .assert()
        .success();

    let assert = fabricsync_cmd(home.path())
        .args(["drift", "dc1", "--json"])
        .assert()
        .success();
    let report: serde_json::Value =
        serde_json::from_slice(&assert.get_output().stdout).expect("drift json");
    assert_eq!(report["summary"]["spec_drift"], 1);
    assert_eq!(report["resources"][0]["drift_status"], "spec_drift");
    assert_eq!(report["resources"][0]["differing_fields"][0], "mtu");

    let assert = fabricsync_cmd(home.path())
        .args(["drift", "dc1", "--diff"])
        .assert()
        .success()
        .stdout(contains("--- a/default/VPC/vpc-1"));
    let stdout = String::from_utf8(assert.get_output().stdout.clone()).expect("utf8");
    assert!(stdout.lines().any(|l| l.starts_with('-') && l.contains("9000")));
    assert!(stdout.lines().any(|l| l.starts_with('+') && l.contains("1500")));
    assert!(
        !stdout.lines().any(|l| l.starts_with('+') && l.contains("vlan")),
        "unchanged fields must not appear as edits"
    );
}

#[test]
fn unknown_fabric_fails_with_hint() {
    let home = TempDir::new().expect("home");
    fabricsync_cmd(home.path())
        .args(["drift", "nope"])
        .assert()
        .failure()
        .stderr(contains("unknown fabric 'nope'"));
}
