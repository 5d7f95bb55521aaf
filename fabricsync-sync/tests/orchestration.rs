use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use fabricsync_core::{
    registry::{self, InitOptions},
    types::{
        ClusterRef, ConflictPolicy, ConflictResolution, ConflictStatus, DriftStatus, Fabric,
        FabricName, FabricSyncStatus, OperationStatus, OperationType, RepositoryRef, ResourceKey,
        SyncOperation,
    },
};
use fabricsync_sync::{
    census,
    ingest::managed_hash_key,
    lease::LeaseManager,
    local::{DirectoryRepository, SnapshotCluster},
    store::snapshot_path_at,
    CallPolicy, FabricLayout, OrchestratorConfig, ResourceFilter, ResourceStore, SyncOrchestrator,
};
use serde_json::json;
use tempfile::TempDir;

const TWO_DOCS: &str = "\
apiVersion: vpc.githedgehog.com/v1beta1
kind: VPC
metadata:
  name: vpc-a
spec:
  mtu: 9000
---
apiVersion: v1
metadata:
  name: not-a-resource
data:
  x: 1
";

fn vpc(name: &str, mtu: u32) -> String {
    format!(
        "apiVersion: vpc.githedgehog.com/v1beta1\nkind: VPC\nmetadata:\n  name: {name}\nspec:\n  mtu: {mtu}\n"
    )
}

fn config() -> OrchestratorConfig {
    OrchestratorConfig {
        lease_ttl: Duration::from_secs(60),
        call_policy: CallPolicy {
            timeout: Duration::from_secs(5),
            retries: 0,
            backoff_base: Duration::from_millis(1),
        },
        ..OrchestratorConfig::default()
    }
}

struct Env {
    home: TempDir,
    workspace: TempDir,
    fabric: FabricName,
}

impl Env {
    fn new() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let home = TempDir::new().expect("home");
        let workspace = TempDir::new().expect("workspace");
        let root = workspace.path().join("dc1");
        fs::create_dir_all(root.join("raw")).expect("mkdir raw");
        registry::init_at(root, FabricName::from("dc1"), InitOptions::default(), home.path())
            .expect("init");
        Self {
            home,
            workspace,
            fabric: FabricName::from("dc1"),
        }
    }

    fn root(&self) -> PathBuf {
        self.workspace.path().join("dc1")
    }

    fn repo_dir(&self) -> PathBuf {
        self.workspace.path().join("repo")
    }

    fn cluster_dir(&self) -> PathBuf {
        self.workspace.path().join("cluster")
    }

    fn update(&self, mutate: impl FnOnce(&mut Fabric)) {
        registry::update_fabric_at(self.home.path(), &self.fabric, mutate).expect("update");
    }

    fn with_repository(&self) {
        fs::create_dir_all(self.repo_dir()).expect("mkdir repo");
        let location = self.repo_dir().display().to_string();
        self.update(|f| {
            f.repository = Some(RepositoryRef {
                location,
                branch: "main".into(),
                path: "fabrics/dc1".into(),
            });
        });
    }

    fn with_cluster(&self) {
        fs::create_dir_all(self.cluster_dir()).expect("mkdir cluster");
        let server = format!("file://{}", self.cluster_dir().display());
        self.update(|f| {
            f.cluster = Some(ClusterRef {
                server,
                kinds: vec!["VPC".into()],
                credentials_env: None,
            });
        });
    }

    fn orchestrator(&self) -> SyncOrchestrator {
        SyncOrchestrator::new(
            self.home.path(),
            Arc::new(ResourceStore::default()),
            Some(Arc::new(DirectoryRepository::new())),
            Some(Arc::new(SnapshotCluster::new())),
            config(),
        )
    }

    fn fabric_record(&self) -> Fabric {
        registry::load_fabric_at(self.home.path(), &self.fabric).expect("load")
    }

    fn key(&self, name: &str) -> ResourceKey {
        ResourceKey::new(self.fabric.clone(), "default", "VPC", name)
    }

    fn managed_file(&self, name: &str) -> PathBuf {
        self.root().join(managed_hash_key("default", "VPC", name))
    }

    fn remote_managed_file(&self, name: &str) -> PathBuf {
        self.repo_dir()
            .join("fabrics/dc1")
            .join(managed_hash_key("default", "VPC", name))
    }

    /// Reconcile vpc-a at 9000 on both sides, then move desired to 9100 and
    /// actual to 1500 and run the cycle that sees it.
    async fn diverge(&self, orchestrator: &SyncOrchestrator) {
        fs::write(self.root().join("raw/vpc.yaml"), vpc("vpc-a", 9000)).expect("write");
        fs::write(self.cluster_dir().join("vpc-a.yaml"), vpc("vpc-a", 9000)).expect("write");
        orchestrator.run_cycle(&self.fabric, "alice").await.expect("cycle");
        assert_eq!(
            orchestrator.store().get(&self.key("vpc-a")).expect("get").drift_status,
            DriftStatus::InSync
        );

        fs::write(self.root().join("raw/vpc-edit.yaml"), vpc("vpc-a", 9100)).expect("write");
        fs::write(self.cluster_dir().join("vpc-a.yaml"), vpc("vpc-a", 1500)).expect("write");
        orchestrator.run_cycle(&self.fabric, "alice").await.expect("cycle");
    }
}

/// Every file below `dir` whose content mentions `needle`.
fn files_mentioning(dir: &Path, needle: &str) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let Ok(entries) = fs::read_dir(dir) else {
        return out;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            out.extend(files_mentioning(&path, needle));
        } else if fs::read_to_string(&path).map_or(false, |c| c.contains(needle)) {
            out.push(path);
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Ingestion
// ---------------------------------------------------------------------------

#[tokio::test]
async fn ingestion_normalizes_one_valid_document_and_archives_the_source() {
    let env = Env::new();
    fs::write(env.root().join("raw/mixed.yaml"), TWO_DOCS).expect("write");
    let layout = FabricLayout::new(env.root());
    let before = census(&layout).expect("census");

    let orchestrator = env.orchestrator();
    let op = orchestrator
        .run(&env.fabric, OperationType::Ingestion, "alice")
        .await
        .expect("run");

    assert_eq!(op.status, OperationStatus::Completed);
    assert_eq!(op.files_processed, 1);
    assert_eq!(op.files_created, 1);

    let managed = files_mentioning(&env.root().join("managed"), "vpc-a");
    assert_eq!(managed.len(), 1);
    assert!(!env.root().join("raw/mixed.yaml").exists());
    let archived = files_mentioning(&env.root().join("raw"), "vpc-a");
    assert_eq!(archived.len(), 1, "raw file must be archived, not deleted");

    let resources = orchestrator
        .store()
        .list_by_fabric(&env.fabric, &ResourceFilter::default());
    assert_eq!(resources.len(), 1);
    assert_eq!(resources[0].drift_status, DriftStatus::DesiredOnly);

    assert_eq!(census(&layout).expect("census").unique, before.unique);
}

#[tokio::test]
async fn second_ingestion_writes_nothing() {
    let env = Env::new();
    fs::write(env.root().join("raw/vpc.yaml"), vpc("vpc-a", 9000)).expect("write");
    let orchestrator = env.orchestrator();
    orchestrator
        .run(&env.fabric, OperationType::Ingestion, "alice")
        .await
        .expect("first");
    let version = orchestrator.store().get(&env.key("vpc-a")).expect("get").version;

    let second = orchestrator
        .run(&env.fabric, OperationType::Ingestion, "alice")
        .await
        .expect("second");
    assert_eq!(second.status, OperationStatus::Completed);
    assert_eq!(second.files_created + second.files_updated, 0);
    assert_eq!(
        orchestrator.store().get(&env.key("vpc-a")).expect("get").version,
        version
    );
}

#[tokio::test]
async fn completed_cycle_updates_fabric_status() {
    let env = Env::new();
    fs::write(env.root().join("raw/vpc.yaml"), vpc("vpc-a", 9000)).expect("write");
    env.orchestrator()
        .run_cycle(&env.fabric, "alice")
        .await
        .expect("cycle");

    let fabric = env.fabric_record();
    assert!(fabric.last_sync.is_some());
    assert_eq!(fabric.drift_count, 1);
    assert_eq!(fabric.sync_status, FabricSyncStatus::OutOfSync);
    assert_eq!(fabric.failure_streak, 0);
}

#[tokio::test]
async fn snapshot_survives_a_new_process() {
    let env = Env::new();
    fs::write(env.root().join("raw/vpc.yaml"), vpc("vpc-a", 9000)).expect("write");
    env.orchestrator()
        .run(&env.fabric, OperationType::Ingestion, "alice")
        .await
        .expect("run");

    let fresh = env.orchestrator();
    let op = fresh
        .run(&env.fabric, OperationType::ConflictResolution, "alice")
        .await
        .expect("run");
    assert_eq!(op.status, OperationStatus::Completed);
    assert!(fresh.store().get(&env.key("vpc-a")).expect("get").has_desired());
}

// ---------------------------------------------------------------------------
// Mutual exclusion and lifecycle
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn simultaneous_starts_yield_one_operation_and_one_busy() {
    let env = Env::new();
    let a = Arc::new(env.orchestrator());
    let b = Arc::new(env.orchestrator());

    let fa = env.fabric.clone();
    let fb = env.fabric.clone();
    let (ra, rb) = tokio::join!(
        tokio::spawn({
            let a = Arc::clone(&a);
            async move {
                a.start_operation(&fa, OperationType::Ingestion, "alice")
                    .await
                    .map(|h| h.operation().clone())
            }
        }),
        tokio::spawn({
            let b = Arc::clone(&b);
            async move {
                b.start_operation(&fb, OperationType::Ingestion, "bob")
                    .await
                    .map(|h| h.operation().clone())
            }
        }),
    );
    let outcomes = [ra.expect("join"), rb.expect("join")];

    let started: Vec<_> = outcomes.iter().filter_map(|o| o.as_ref().ok()).collect();
    let busy = outcomes
        .iter()
        .filter(|o| o.as_ref().err().map_or(false, |e| e.is_busy()))
        .count();
    assert_eq!(started.len(), 1);
    assert_eq!(busy, 1);
    assert_eq!(started[0].status, OperationStatus::InProgress);

    let journal = a.journal().list(&env.fabric, 10).expect("journal");
    assert_eq!(journal.len(), 2);
    assert_eq!(
        journal
            .iter()
            .filter(|op| op.status == OperationStatus::Failed)
            .count(),
        1
    );
}

#[tokio::test]
async fn busy_fabric_frees_up_after_completion() {
    let env = Env::new();
    let orchestrator = env.orchestrator();
    let handle = orchestrator
        .start_operation(&env.fabric, OperationType::Ingestion, "alice")
        .await
        .expect("start");
    let refused = orchestrator
        .run(&env.fabric, OperationType::Ingestion, "bob")
        .await
        .expect_err("busy");
    assert!(refused.is_busy());

    orchestrator.execute(handle).await.expect("execute");
    assert!(orchestrator
        .run(&env.fabric, OperationType::Ingestion, "bob")
        .await
        .is_ok());
}

#[tokio::test]
async fn cancelled_operation_ends_cancelled_and_releases_the_lease() {
    let env = Env::new();
    fs::write(env.root().join("raw/vpc.yaml"), vpc("vpc-a", 9000)).expect("write");
    let orchestrator = env.orchestrator();
    let handle = orchestrator
        .start_operation(&env.fabric, OperationType::Ingestion, "alice")
        .await
        .expect("start");
    assert!(orchestrator.cancel(&handle.operation().id));

    let op = orchestrator.execute(handle).await.expect("execute");
    assert_eq!(op.status, OperationStatus::Cancelled);
    assert!(orchestrator.leases().current(&env.fabric).expect("lease").is_none());
    assert!(env.root().join("raw/vpc.yaml").exists(), "nothing ingested");
}

#[tokio::test]
async fn terminal_records_are_journaled_once() {
    let env = Env::new();
    let orchestrator = env.orchestrator();
    let op = orchestrator
        .run(&env.fabric, OperationType::DirectoryInit, "alice")
        .await
        .expect("run");
    assert_eq!(op.status, OperationStatus::Completed);
    assert!(env.root().join("managed").is_dir());
    assert!(env.root().join("archive").is_dir());

    let stored = orchestrator
        .journal()
        .load(&env.fabric, &op.id)
        .expect("load")
        .expect("present");
    assert_eq!(stored.status, OperationStatus::Completed);
    assert!(orchestrator.journal().save(&stored).is_err());
}

// ---------------------------------------------------------------------------
// Push and pull
// ---------------------------------------------------------------------------

#[tokio::test]
async fn push_commits_changes_once() {
    let env = Env::new();
    env.with_repository();
    fs::write(env.root().join("raw/vpc.yaml"), vpc("vpc-a", 9000)).expect("write");
    let orchestrator = env.orchestrator();
    orchestrator
        .run(&env.fabric, OperationType::Ingestion, "alice")
        .await
        .expect("ingest");

    let push = orchestrator
        .run(&env.fabric, OperationType::GuiToGithub, "alice")
        .await
        .expect("push");
    assert_eq!(push.status, OperationStatus::Completed);
    assert_eq!(push.files_created, 1);
    assert!(push.commit_sha.is_some());

    let remote = env
        .repo_dir()
        .join("fabrics/dc1")
        .join(managed_hash_key("default", "VPC", "vpc-a"));
    assert!(fs::read_to_string(&remote).expect("remote").contains("vpc-a"));

    let r = orchestrator.store().get(&env.key("vpc-a")).expect("get");
    assert_eq!(r.last_synced_commit, push.commit_sha);
    assert_eq!(r.drift_status, DriftStatus::CreationPending);
    assert_eq!(r.sync_attempts, 1);
    assert_eq!(r.reconciliation_attempts, 1);

    let again = orchestrator
        .run(&env.fabric, OperationType::GuiToGithub, "alice")
        .await
        .expect("push again");
    assert_eq!(again.files_created + again.files_updated, 0);
}

#[tokio::test]
async fn pull_ingests_remote_files_and_follows_remote_edits() {
    let env = Env::new();
    env.with_repository();
    let remote_raw = env.repo_dir().join("fabrics/dc1/raw");
    fs::create_dir_all(&remote_raw).expect("mkdir");
    fs::write(remote_raw.join("vpc.yaml"), vpc("vpc-a", 9000)).expect("write");

    let orchestrator = env.orchestrator();
    let pull = orchestrator
        .run(&env.fabric, OperationType::GithubToGui, "alice")
        .await
        .expect("pull");
    assert_eq!(pull.status, OperationStatus::Completed, "{:?}", pull.details);
    let r = orchestrator.store().get(&env.key("vpc-a")).expect("get");
    assert_eq!(r.desired_commit, pull.commit_sha);
    assert_eq!(env.fabric_record().last_synced_commit, pull.commit_sha);

    // Publish the managed copy, then edit it upstream.
    orchestrator
        .run(&env.fabric, OperationType::GuiToGithub, "alice")
        .await
        .expect("push");
    let remote_managed = env
        .repo_dir()
        .join("fabrics/dc1")
        .join(managed_hash_key("default", "VPC", "vpc-a"));
    let edited = fs::read_to_string(&remote_managed)
        .expect("read")
        .replace("9000", "9100");
    fs::write(&remote_managed, edited).expect("edit");

    let pull = orchestrator
        .run(&env.fabric, OperationType::GithubToGui, "alice")
        .await
        .expect("pull again");
    assert_eq!(pull.status, OperationStatus::Completed);
    assert_eq!(pull.files_updated, 1);
    let r = orchestrator.store().get(&env.key("vpc-a")).expect("get");
    assert_eq!(r.desired_spec, Some(json!({"mtu": 9100})));
}

#[tokio::test]
async fn pull_without_reachable_repository_fails_the_operation() {
    let env = Env::new();
    let missing = env.workspace.path().join("nowhere").display().to_string();
    env.update(|f| {
        f.repository = Some(RepositoryRef {
            location: missing,
            branch: "main".into(),
            path: String::new(),
        });
    });

    let op = env
        .orchestrator()
        .run(&env.fabric, OperationType::GithubToGui, "scheduler")
        .await
        .expect("run");
    assert_eq!(op.status, OperationStatus::Failed);
    let fabric = env.fabric_record();
    assert_eq!(fabric.sync_status, FabricSyncStatus::Error);
    assert_eq!(fabric.failure_streak, 1);
    assert!(fabric.last_sync_error.is_some());
    assert!(fabric.last_sync.is_none());
    let attempted = fabric.last_attempt.expect("attempt recorded");
    assert!(!fabric.is_due(attempted));
}

#[tokio::test]
async fn directory_init_mirrors_keep_markers_into_repository() {
    let env = Env::new();
    env.with_repository();
    let orchestrator = env.orchestrator();
    let op = orchestrator
        .run(&env.fabric, OperationType::DirectoryInit, "alice")
        .await
        .expect("run");
    assert_eq!(op.status, OperationStatus::Completed);
    assert!(op.commit_sha.is_some());
    for dir in ["raw", "managed"] {
        assert!(env.repo_dir().join("fabrics/dc1").join(dir).join(".gitkeep").exists());
    }

    let again = orchestrator
        .run(&env.fabric, OperationType::DirectoryInit, "alice")
        .await
        .expect("run again");
    assert_eq!(again.files_created, 0);
}

// ---------------------------------------------------------------------------
// Collection and conflicts
// ---------------------------------------------------------------------------

#[tokio::test]
async fn collected_actual_state_brings_resource_in_sync() {
    let env = Env::new();
    env.with_cluster();
    fs::write(env.root().join("raw/vpc.yaml"), vpc("vpc-a", 9000)).expect("write");
    fs::write(env.cluster_dir().join("vpc-a.yaml"), vpc("vpc-a", 9000)).expect("write");

    let orchestrator = env.orchestrator();
    orchestrator.run_cycle(&env.fabric, "alice").await.expect("cycle");

    let r = orchestrator.store().get(&env.key("vpc-a")).expect("get");
    assert_eq!(r.drift_status, DriftStatus::InSync);
    assert_eq!(r.drift_score, 0.0);
    assert_eq!(env.fabric_record().sync_status, FabricSyncStatus::InSync);
}

#[tokio::test]
async fn diverging_sides_are_flagged_then_resolved_by_operator() {
    let env = Env::new();
    env.with_cluster();
    fs::write(env.root().join("raw/vpc.yaml"), vpc("vpc-a", 9000)).expect("write");
    fs::write(env.cluster_dir().join("vpc-a.yaml"), vpc("vpc-a", 9000)).expect("write");
    let orchestrator = env.orchestrator();
    orchestrator.run_cycle(&env.fabric, "alice").await.expect("cycle");

    // Both sides move away from the reconciled point.
    fs::write(env.root().join("raw/vpc-edit.yaml"), vpc("vpc-a", 9100)).expect("write");
    fs::write(env.cluster_dir().join("vpc-a.yaml"), vpc("vpc-a", 1500)).expect("write");
    orchestrator.run_cycle(&env.fabric, "alice").await.expect("cycle");

    let r = orchestrator.store().get(&env.key("vpc-a")).expect("get");
    assert_eq!(r.conflict_status, ConflictStatus::Conflicted);
    assert_eq!(r.conflict_details.len(), 1);
    assert!(r.autosync_halted());

    let op = orchestrator
        .resolve_conflict(&env.key("vpc-a"), ConflictResolution::TakeActual, "alice")
        .await
        .expect("resolve");
    assert_eq!(op.status, OperationStatus::Completed);
    let r = orchestrator.store().get(&env.key("vpc-a")).expect("get");
    assert_eq!(r.conflict_status, ConflictStatus::Resolved);
    assert_eq!(r.desired_spec, r.actual_spec);
    assert_eq!(r.drift_status, DriftStatus::InSync);
    assert_eq!(r.conflict_details[0].resolved_by.as_deref(), Some("alice"));
}

#[tokio::test]
async fn desired_wins_policy_resolves_without_operator() {
    let env = Env::new();
    env.with_cluster();
    env.update(|f| f.conflict_policy = ConflictPolicy::DesiredWins);
    fs::write(env.root().join("raw/vpc.yaml"), vpc("vpc-a", 9000)).expect("write");
    fs::write(env.cluster_dir().join("vpc-a.yaml"), vpc("vpc-a", 9000)).expect("write");
    let orchestrator = env.orchestrator();
    orchestrator.run_cycle(&env.fabric, "alice").await.expect("cycle");

    fs::write(env.root().join("raw/vpc-edit.yaml"), vpc("vpc-a", 9100)).expect("write");
    fs::write(env.cluster_dir().join("vpc-a.yaml"), vpc("vpc-a", 1500)).expect("write");
    orchestrator.run_cycle(&env.fabric, "alice").await.expect("cycle");

    let r = orchestrator.store().get(&env.key("vpc-a")).expect("get");
    assert_eq!(r.conflict_status, ConflictStatus::Resolved);
    assert_eq!(r.desired_spec, Some(json!({"mtu": 9100})));
    assert_eq!(r.drift_status, DriftStatus::SpecDrift);
    assert!(r.last_synced_commit.is_none());
}

#[tokio::test]
async fn resolving_without_open_conflict_fails() {
    let env = Env::new();
    fs::write(env.root().join("raw/vpc.yaml"), vpc("vpc-a", 9000)).expect("write");
    let orchestrator = env.orchestrator();
    orchestrator.run_cycle(&env.fabric, "alice").await.expect("cycle");

    let op = orchestrator
        .resolve_conflict(&env.key("vpc-a"), ConflictResolution::KeepDesired, "alice")
        .await
        .expect("run");
    assert_eq!(op.status, OperationStatus::Failed);
    assert!(op.error_message.unwrap_or_default().contains("no open conflict"));
}

#[tokio::test]
async fn operator_take_actual_survives_the_next_cycle() {
    let env = Env::new();
    env.with_cluster();
    let orchestrator = env.orchestrator();
    env.diverge(&orchestrator).await;
    orchestrator
        .resolve_conflict(&env.key("vpc-a"), ConflictResolution::TakeActual, "alice")
        .await
        .expect("resolve");
    assert!(fs::read_to_string(env.managed_file("vpc-a"))
        .expect("managed")
        .contains("mtu: 1500"));

    let cycle = orchestrator.run_cycle(&env.fabric, "alice").await.expect("cycle");
    assert_eq!(cycle.status, OperationStatus::Completed);

    let r = orchestrator.store().get(&env.key("vpc-a")).expect("get");
    assert_eq!(r.desired_spec, Some(json!({"mtu": 1500})));
    assert_eq!(r.drift_status, DriftStatus::InSync);
    assert_eq!(r.conflict_status, ConflictStatus::Resolved);
    assert_eq!(r.conflict_details.len(), 1);
    assert_eq!(r.reconciliation_attempts, 1);
}

#[tokio::test]
async fn actual_wins_policy_survives_the_next_cycle() {
    let env = Env::new();
    env.with_cluster();
    env.update(|f| f.conflict_policy = ConflictPolicy::ActualWins);
    let orchestrator = env.orchestrator();
    env.diverge(&orchestrator).await;

    let r = orchestrator.store().get(&env.key("vpc-a")).expect("get");
    assert_eq!(r.conflict_status, ConflictStatus::Resolved);
    assert_eq!(r.desired_spec, Some(json!({"mtu": 1500})));

    orchestrator.run_cycle(&env.fabric, "alice").await.expect("cycle");
    let r = orchestrator.store().get(&env.key("vpc-a")).expect("get");
    assert_eq!(r.desired_spec, Some(json!({"mtu": 1500})));
    assert_eq!(r.drift_status, DriftStatus::InSync);
    assert_eq!(r.conflict_details.len(), 1);
    assert_eq!(
        r.conflict_details[0].resolved_by.as_deref(),
        Some("policy:actual_wins")
    );
}

#[tokio::test]
async fn desired_wins_policy_is_not_reflagged_by_the_next_cycle() {
    let env = Env::new();
    env.with_cluster();
    env.update(|f| f.conflict_policy = ConflictPolicy::DesiredWins);
    let orchestrator = env.orchestrator();
    env.diverge(&orchestrator).await;

    orchestrator.run_cycle(&env.fabric, "alice").await.expect("cycle");
    let r = orchestrator.store().get(&env.key("vpc-a")).expect("get");
    assert_eq!(r.desired_spec, Some(json!({"mtu": 9100})));
    assert_eq!(r.drift_status, DriftStatus::SpecDrift);
    assert_eq!(r.conflict_status, ConflictStatus::Resolved);
    assert_eq!(r.conflict_details.len(), 1);
    assert!(!r.autosync_halted());
}

#[tokio::test]
async fn adopted_actual_is_kept_by_pull_and_published_by_push() {
    let env = Env::new();
    env.with_cluster();
    env.with_repository();
    fs::write(env.root().join("raw/vpc.yaml"), vpc("vpc-a", 9000)).expect("write");
    fs::write(env.cluster_dir().join("vpc-a.yaml"), vpc("vpc-a", 9000)).expect("write");
    let orchestrator = env.orchestrator();
    orchestrator
        .run(&env.fabric, OperationType::Ingestion, "alice")
        .await
        .expect("ingest");
    orchestrator
        .run(&env.fabric, OperationType::GuiToGithub, "alice")
        .await
        .expect("push");

    // Upstream and cluster move apart from the pushed 9000.
    let remote = env.remote_managed_file("vpc-a");
    let edited = fs::read_to_string(&remote).expect("remote").replace("9000", "9100");
    fs::write(&remote, edited).expect("edit remote");
    fs::write(env.cluster_dir().join("vpc-a.yaml"), vpc("vpc-a", 1500)).expect("write");
    orchestrator.run_cycle(&env.fabric, "alice").await.expect("pull");
    let r = orchestrator.store().get(&env.key("vpc-a")).expect("get");
    assert_eq!(r.conflict_status, ConflictStatus::Conflicted);

    orchestrator
        .resolve_conflict(&env.key("vpc-a"), ConflictResolution::TakeActual, "alice")
        .await
        .expect("resolve");

    let pull = orchestrator.run_cycle(&env.fabric, "alice").await.expect("pull again");
    assert_eq!(pull.status, OperationStatus::Completed, "{:?}", pull.details);
    let r = orchestrator.store().get(&env.key("vpc-a")).expect("get");
    assert_eq!(r.desired_spec, Some(json!({"mtu": 1500})));
    assert_eq!(r.drift_status, DriftStatus::InSync);
    assert!(fs::read_to_string(env.managed_file("vpc-a"))
        .expect("managed")
        .contains("mtu: 1500"));

    let push = orchestrator
        .run(&env.fabric, OperationType::GuiToGithub, "alice")
        .await
        .expect("push adopted");
    assert_eq!(push.files_updated, 1);
    assert!(fs::read_to_string(&remote).expect("remote").contains("mtu: 1500"));
}

// ---------------------------------------------------------------------------
// Start-up failures and abandoned records
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unreadable_snapshot_fails_the_record_and_frees_the_lease() {
    let env = Env::new();
    let snapshot = snapshot_path_at(env.home.path(), &env.fabric);
    fs::create_dir_all(snapshot.parent().expect("parent")).expect("mkdir");
    fs::write(&snapshot, "not json").expect("corrupt");

    let orchestrator = env.orchestrator();
    let err = orchestrator
        .run(&env.fabric, OperationType::Ingestion, "alice")
        .await
        .expect_err("snapshot unreadable");
    assert!(!err.is_busy());

    let journal = orchestrator.journal().list(&env.fabric, 10).expect("journal");
    assert_eq!(journal.len(), 1);
    assert_eq!(journal[0].status, OperationStatus::Failed);
    assert!(journal[0].error_message.is_some());
    assert!(orchestrator.journal().in_progress(&env.fabric).expect("scan").is_empty());
    assert!(orchestrator.leases().current(&env.fabric).expect("lease").is_none());

    fs::remove_file(&snapshot).expect("repair");
    let op = orchestrator
        .run(&env.fabric, OperationType::Ingestion, "alice")
        .await
        .expect("run after repair");
    assert_eq!(op.status, OperationStatus::Completed);
}

#[tokio::test]
async fn record_left_in_progress_by_a_lost_holder_is_closed() {
    let env = Env::new();
    let orchestrator = env.orchestrator();

    let mut orphan = SyncOperation::new(
        "crashed-op",
        env.fabric.clone(),
        OperationType::Ingestion,
        "bob",
    );
    orphan.begin().expect("begin");
    orchestrator.journal().save(&orphan).expect("journal");
    LeaseManager::new(env.home.path(), "crashed-holder", Duration::ZERO)
        .try_acquire(&env.fabric, &orphan.id)
        .expect("stale lease");

    let op = orchestrator
        .run(&env.fabric, OperationType::Ingestion, "alice")
        .await
        .expect("takeover");
    assert_eq!(op.status, OperationStatus::Completed);

    let closed = orchestrator
        .journal()
        .load(&env.fabric, "crashed-op")
        .expect("load")
        .expect("present");
    assert_eq!(closed.status, OperationStatus::Failed);
    assert!(closed.error_message.unwrap_or_default().contains("abandoned"));
    assert!(orchestrator.journal().in_progress(&env.fabric).expect("scan").is_empty());
}
