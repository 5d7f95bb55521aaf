use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::Utc;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio::task::JoinSet;

use fabricsync_core::registry;
use fabricsync_core::types::{FabricName, OperationType, SyncOperation};
use fabricsync_sync::{
    drift_report_at, is_fabric_failure, pipeline, SyncError, SyncOrchestrator,
    SCHEDULER_INITIATOR,
};

use crate::error::{io_err, DaemonError};
use crate::paths::{logs_dir, run_dir, socket_path};
use crate::protocol::{DaemonRequest, DaemonResponse};
use crate::scheduler::{plan_tick, TickPlan};
use crate::settings::DaemonSettings;

/// Initiator recorded on operations triggered over the control socket.
pub const MANUAL_INITIATOR: &str = "daemon";

/// Fabrics with a cycle currently dispatched by this daemon.
pub type InFlight = Arc<RwLock<HashSet<FabricName>>>;

type JobOutcome = Result<SyncOperation, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobSource {
    Scheduler,
    Socket,
}

impl JobSource {
    fn initiator(self) -> &'static str {
        match self {
            JobSource::Scheduler => SCHEDULER_INITIATOR,
            JobSource::Socket => MANUAL_INITIATOR,
        }
    }
}

struct SyncJob {
    fabric: FabricName,
    operation: Option<OperationType>,
    source: JobSource,
    respond_to: Option<oneshot::Sender<JobOutcome>>,
}

/// State shared by the daemon's tasks.
#[derive(Clone)]
struct Shared {
    home: PathBuf,
    settings: DaemonSettings,
    orchestrator: Arc<SyncOrchestrator>,
    in_flight: InFlight,
    last_tick_unix: Arc<RwLock<u64>>,
    started_at_unix: u64,
}

/// Start the daemon runtime and block the current thread until it exits.
pub fn start_blocking(home: &Path) -> Result<(), DaemonError> {
    init_tracing();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(home.to_path_buf()))
}

/// Run the daemon runtime.
pub async fn run(home: PathBuf) -> Result<(), DaemonError> {
    ensure_runtime_dirs(&home)?;
    let settings = DaemonSettings::load_at(&home)?;
    tracing::info!(
        tick_secs = settings.tick_interval_secs,
        ceiling = settings.concurrency_ceiling,
        "daemon starting",
    );

    let shared = Shared {
        orchestrator: Arc::new(pipeline::local_orchestrator(
            &home,
            settings.orchestrator_config(),
        )),
        home,
        settings,
        in_flight: Arc::new(RwLock::new(HashSet::new())),
        last_tick_unix: Arc::new(RwLock::new(0)),
        started_at_unix: unix_seconds_now(),
    };

    let (job_tx, job_rx) = mpsc::channel::<SyncJob>(64);
    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    let tick_handle = {
        let shutdown = shutdown_tx.clone();
        let shared = shared.clone();
        let job_tx = job_tx.clone();
        tokio::spawn(async move {
            let result = scheduler_task(shared, job_tx, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let processor_handle = {
        let shutdown = shutdown_tx.clone();
        let shared = shared.clone();
        tokio::spawn(async move {
            let result = sync_processor_task(shared, job_rx, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let shared = shared.clone();
        let job_tx = job_tx.clone();
        tokio::spawn(async move {
            let result =
                socket_server_task(shared, job_tx, shutdown.clone(), shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => {
                            tracing::info!("received ctrl-c, shutting down daemon");
                            let _ = shutdown.send(());
                            Ok(())
                        }
                        Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
                    }
                }
            }
        })
    };
    drop(job_tx);

    let (tick_result, processor_result, socket_result, signal_result) =
        tokio::join!(tick_handle, processor_handle, socket_handle, signal_handle);

    handle_join("scheduler", tick_result)?;
    handle_join("sync_processor", processor_result)?;
    handle_join("socket_server", socket_result)?;
    handle_join("signal_handler", signal_result)?;
    Ok(())
}

async fn scheduler_task(
    shared: Shared,
    job_tx: mpsc::Sender<SyncJob>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut interval = tokio::time::interval(shared.settings.tick_interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => {
                match tick_once(&shared, &job_tx).await {
                    Ok(plan) if !plan.is_empty() => {
                        tracing::info!(
                            dispatched = plan.dispatch.len(),
                            deferred = plan.deferred.len(),
                            "scheduler tick",
                        );
                    }
                    Ok(_) => tracing::debug!("scheduler tick: nothing due"),
                    Err(DaemonError::ChannelClosed(what)) => {
                        return Err(DaemonError::ChannelClosed(what));
                    }
                    Err(err) => tracing::error!(error = %err, "scheduler tick failed"),
                }
            }
        }
    }
    Ok(())
}

/// Plan one tick against the registry and hand the due fabrics to the
/// processor.
async fn tick_once(shared: &Shared, job_tx: &mpsc::Sender<SyncJob>) -> Result<TickPlan, DaemonError> {
    let home = shared.home.clone();
    let fabrics = tokio::task::spawn_blocking(move || registry::list_fabrics_at(&home))
        .await
        .map_err(|err| DaemonError::Protocol(format!("registry load join error: {err}")))??;

    let plan = {
        let in_flight = shared.in_flight.read().await;
        plan_tick(
            &fabrics,
            Utc::now(),
            &in_flight,
            shared.settings.concurrency_ceiling,
            shared.settings.backoff_threshold,
        )
    };
    *shared.last_tick_unix.write().await = unix_seconds_now();

    for fabric in &plan.deferred {
        tracing::debug!(fabric = %fabric, "deferred to next tick: concurrency ceiling reached");
    }
    for dispatch in &plan.dispatch {
        tracing::info!(fabric = %dispatch.fabric, priority = %dispatch.priority, "dispatching sync cycle");
        job_tx
            .send(SyncJob {
                fabric: dispatch.fabric.clone(),
                operation: None,
                source: JobSource::Scheduler,
                respond_to: None,
            })
            .await
            .map_err(|_| DaemonError::ChannelClosed("sync queue"))?;
    }
    Ok(plan)
}

async fn sync_processor_task(
    shared: Shared,
    mut job_rx: mpsc::Receiver<SyncJob>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut running = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            Some(joined) = running.join_next(), if !running.is_empty() => {
                if let Err(err) = joined {
                    tracing::error!(error = %err, "sync task join failure");
                }
            }
            maybe_job = job_rx.recv() => {
                let Some(job) = maybe_job else { break };
                if !shared.in_flight.write().await.insert(job.fabric.clone()) {
                    tracing::debug!(fabric = %job.fabric, "cycle already in flight, skipping");
                    if let Some(respond_to) = job.respond_to {
                        let _ = respond_to.send(Err(format!(
                            "fabric '{}' already has an operation in flight",
                            job.fabric
                        )));
                    }
                    continue;
                }
                running.spawn(run_job(shared.clone(), job));
            }
        }
    }

    // Cancellation is cooperative: let in-flight cycles reach a terminal state.
    while let Some(joined) = running.join_next().await {
        if let Err(err) = joined {
            tracing::error!(error = %err, "sync task join failure");
        }
    }
    Ok(())
}

async fn run_job(shared: Shared, job: SyncJob) {
    let initiated_by = job.source.initiator();
    let outcome = match job.operation {
        Some(op) => shared.orchestrator.run(&job.fabric, op, initiated_by).await,
        None => shared.orchestrator.run_cycle(&job.fabric, initiated_by).await,
    };
    shared.in_flight.write().await.remove(&job.fabric);

    log_outcome(&job.fabric, &outcome);
    if let Some(respond_to) = job.respond_to {
        let _ = respond_to.send(outcome.map_err(|e| e.to_string()));
    }
}

fn log_outcome(fabric: &FabricName, outcome: &Result<SyncOperation, SyncError>) {
    match outcome {
        Ok(op) => tracing::info!(
            fabric = %fabric,
            operation = %op.operation_type,
            status = %op.status,
            files_processed = op.files_processed,
            "sync cycle finished",
        ),
        Err(err) if !is_fabric_failure(err) => {
            tracing::info!(fabric = %fabric, reason = %err, "sync cycle skipped");
        }
        Err(err) => tracing::error!(fabric = %fabric, error = %err, "sync cycle failed"),
    }
}

async fn socket_server_task(
    shared: Shared,
    job_tx: mpsc::Sender<SyncJob>,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let run = run_dir(&shared.home);
    if !run.exists() {
        fs::create_dir_all(&run).map_err(|e| io_err(&run, e))?;
    }

    let socket = socket_path(&shared.home);
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;
    tracing::info!(socket = %socket.display(), "control socket listening");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let shared = shared.clone();
                let job_tx = job_tx.clone();
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(stream, shared, job_tx, shutdown_tx).await {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

async fn handle_socket_client(
    stream: UnixStream,
    shared: Shared,
    job_tx: mpsc::Sender<SyncJob>,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("daemon socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request: DaemonRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &DaemonResponse::error(format!("invalid request JSON: {err}")),
                )
                .await?;
                continue;
            }
        };

        let stop = request.cmd == "stop";
        let response = dispatch_request(&shared, &job_tx, &shutdown_tx, request).await;
        write_response(&mut writer, &response).await?;
        if stop {
            break;
        }
    }

    Ok(())
}

async fn dispatch_request(
    shared: &Shared,
    job_tx: &mpsc::Sender<SyncJob>,
    shutdown_tx: &broadcast::Sender<()>,
    request: DaemonRequest,
) -> DaemonResponse {
    let result = match request.cmd.as_str() {
        "status" => build_status_payload(shared).await,
        "sync" => match request.fabric {
            Some(fabric) => trigger_sync(job_tx, FabricName::from(fabric), request.operation).await,
            None => Err(DaemonError::Protocol("sync requires a fabric".to_string())),
        },
        "drift" => match request.fabric {
            Some(fabric) => drift_payload(&shared.home, FabricName::from(fabric)).await,
            None => Err(DaemonError::Protocol("drift requires a fabric".to_string())),
        },
        "cancel" => match request.operation {
            Some(id) => {
                let cancelled = shared.orchestrator.cancel(&id);
                Ok(json!({ "operation": id, "cancelled": cancelled }))
            }
            None => Err(DaemonError::Protocol("cancel requires an operation id".to_string())),
        },
        "stop" => {
            let _ = shutdown_tx.send(());
            Ok(json!({ "stopping": true }))
        }
        other => Err(DaemonError::Protocol(format!("unknown command '{other}'"))),
    };

    match result {
        Ok(data) => DaemonResponse::ok(data),
        Err(err) => DaemonResponse::error(err.to_string()),
    }
}

async fn trigger_sync(
    job_tx: &mpsc::Sender<SyncJob>,
    fabric: FabricName,
    operation: Option<String>,
) -> Result<Value, DaemonError> {
    let operation = operation.map(|raw| parse_operation(&raw)).transpose()?;
    let (tx, rx) = oneshot::channel();
    job_tx
        .send(SyncJob {
            fabric,
            operation,
            source: JobSource::Socket,
            respond_to: Some(tx),
        })
        .await
        .map_err(|_| DaemonError::ChannelClosed("sync queue"))?;

    let op = rx
        .await
        .map_err(|_| DaemonError::ChannelClosed("sync response"))?
        .map_err(DaemonError::Protocol)?;
    Ok(serde_json::to_value(op)?)
}

fn parse_operation(raw: &str) -> Result<OperationType, DaemonError> {
    serde_json::from_value(Value::String(raw.to_string()))
        .map_err(|_| DaemonError::Protocol(format!("unknown operation type '{raw}'")))
}

async fn drift_payload(home: &Path, fabric: FabricName) -> Result<Value, DaemonError> {
    let home = home.to_path_buf();
    let report = tokio::task::spawn_blocking(move || {
        registry::load_fabric_at(&home, &fabric)?;
        drift_report_at(&home, &fabric).map_err(DaemonError::from)
    })
    .await
    .map_err(|err| DaemonError::Protocol(format!("drift report join error: {err}")))??;
    Ok(serde_json::to_value(report)?)
}

async fn build_status_payload(shared: &Shared) -> Result<Value, DaemonError> {
    let home = shared.home.clone();
    let fabrics = tokio::task::spawn_blocking(move || registry::list_fabrics_at(&home))
        .await
        .map_err(|err| DaemonError::Protocol(format!("registry load join error: {err}")))??;

    let mut in_flight: Vec<String> = shared
        .in_flight
        .read()
        .await
        .iter()
        .map(|f| f.0.clone())
        .collect();
    in_flight.sort();
    let last_tick_unix = *shared.last_tick_unix.read().await;

    let summaries: Vec<Value> = fabrics
        .iter()
        .map(|f| {
            let mut entry = json!(f.status_summary());
            entry["scheduler_enabled"] = json!(f.is_schedulable());
            entry["failure_streak"] = json!(f.failure_streak);
            entry
        })
        .collect();

    Ok(json!({
        "running": true,
        "label": crate::paths::DAEMON_LABEL,
        "started_at_unix": shared.started_at_unix,
        "last_tick_unix": last_tick_unix,
        "concurrency_ceiling": shared.settings.concurrency_ceiling,
        "in_flight": in_flight,
        "fabrics": summaries,
        "socket": socket_path(&shared.home).display().to_string(),
    }))
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::Protocol(format!(
                "daemon socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale daemon socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

fn ensure_runtime_dirs(home: &Path) -> Result<(), DaemonError> {
    for dir in [run_dir(home), logs_dir(home)] {
        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        }
    }
    Ok(())
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &DaemonResponse,
) -> Result<(), DaemonError> {
    let payload = serde_json::to_string(response)?;
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))?;
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

fn unix_seconds_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use fabricsync_core::registry::{init_at, InitOptions};
    use fabricsync_core::types::FabricSyncStatus;
    use tempfile::TempDir;

    use super::*;

    const VPC: &str = "apiVersion: vpc.githedgehog.com/v1beta1\nkind: VPC\nmetadata:\n  name: vpc-1\nspec:\n  mtu: 9000\n";

    struct Fixture {
        home: TempDir,
        workspace: TempDir,
        shared: Shared,
    }

    fn fixture(fabrics: &[&str], ceiling: usize) -> Fixture {
        let home = TempDir::new().expect("home");
        let workspace = TempDir::new().expect("workspace");
        for name in fabrics {
            let root = workspace.path().join(name);
            fs::create_dir_all(root.join("raw")).expect("mkdir");
            fs::write(root.join("raw/vpc.yaml"), VPC).expect("write");
            init_at(root, FabricName::from(*name), InitOptions::default(), home.path())
                .expect("init");
        }
        let settings = DaemonSettings {
            concurrency_ceiling: ceiling,
            ..DaemonSettings::default()
        };
        let shared = Shared {
            orchestrator: Arc::new(pipeline::local_orchestrator(
                home.path(),
                settings.orchestrator_config(),
            )),
            home: home.path().to_path_buf(),
            settings,
            in_flight: Arc::new(RwLock::new(HashSet::new())),
            last_tick_unix: Arc::new(RwLock::new(0)),
            started_at_unix: 1_000_000,
        };
        Fixture {
            home,
            workspace,
            shared,
        }
    }

    #[tokio::test]
    async fn tick_dispatches_never_synced_fabrics_up_to_ceiling() {
        let fx = fixture(&["dc1", "dc2", "dc3"], 2);
        let (job_tx, mut job_rx) = mpsc::channel(8);

        let plan = tick_once(&fx.shared, &job_tx).await.expect("tick");
        assert_eq!(plan.dispatch.len(), 2);
        assert_eq!(plan.deferred.len(), 1);

        let mut sent = Vec::new();
        while let Ok(job) = job_rx.try_recv() {
            assert_eq!(job.source, JobSource::Scheduler);
            sent.push(job.fabric);
        }
        assert_eq!(sent.len(), 2);
        assert!(*fx.shared.last_tick_unix.read().await > 0);
    }

    #[tokio::test]
    async fn tick_skips_fabric_already_in_flight() {
        let fx = fixture(&["dc1"], 4);
        fx.shared
            .in_flight
            .write()
            .await
            .insert(FabricName::from("dc1"));
        let (job_tx, mut job_rx) = mpsc::channel(8);

        let plan = tick_once(&fx.shared, &job_tx).await.expect("tick");
        assert!(plan.is_empty());
        assert!(job_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn processor_runs_scheduled_cycle_and_clears_in_flight() {
        let fx = fixture(&["dc1"], 4);
        let (job_tx, job_rx) = mpsc::channel(8);
        let (shutdown_tx, _) = broadcast::channel(1);
        let processor = tokio::spawn(sync_processor_task(
            fx.shared.clone(),
            job_rx,
            shutdown_tx.subscribe(),
        ));

        let outcome = trigger_sync(&job_tx, FabricName::from("dc1"), None)
            .await
            .expect("sync");
        assert_eq!(outcome["status"], json!("completed"));
        assert_eq!(outcome["initiated_by"], json!(MANUAL_INITIATOR));
        assert!(fx.shared.in_flight.read().await.is_empty());

        let fabric = registry::load_fabric_at(fx.home.path(), &FabricName::from("dc1"))
            .expect("fabric");
        assert!(fabric.last_sync.is_some());
        assert_ne!(fabric.sync_status, FabricSyncStatus::NeverSynced);

        drop(job_tx);
        handle_join("sync_processor", processor.await).expect("processor");
        assert!(fx.workspace.path().join("dc1/managed").exists());
    }

    #[tokio::test]
    async fn duplicate_job_for_in_flight_fabric_is_a_no_op() {
        let fx = fixture(&["dc1"], 4);
        fx.shared
            .in_flight
            .write()
            .await
            .insert(FabricName::from("dc1"));
        let (job_tx, job_rx) = mpsc::channel(8);
        let (shutdown_tx, _) = broadcast::channel(1);
        let processor = tokio::spawn(sync_processor_task(
            fx.shared.clone(),
            job_rx,
            shutdown_tx.subscribe(),
        ));

        let err = trigger_sync(&job_tx, FabricName::from("dc1"), None)
            .await
            .expect_err("busy");
        assert!(err.to_string().contains("in flight"));
        assert!(fx
            .shared
            .orchestrator
            .journal()
            .list(&FabricName::from("dc1"), 10)
            .expect("journal")
            .is_empty());

        drop(job_tx);
        handle_join("sync_processor", processor.await).expect("processor");
    }

    #[tokio::test]
    async fn explicit_operation_type_is_honoured() {
        let fx = fixture(&["dc1"], 4);
        let (job_tx, job_rx) = mpsc::channel(8);
        let (shutdown_tx, _) = broadcast::channel(1);
        let processor = tokio::spawn(sync_processor_task(
            fx.shared.clone(),
            job_rx,
            shutdown_tx.subscribe(),
        ));

        let outcome = trigger_sync(
            &job_tx,
            FabricName::from("dc1"),
            Some("directory_init".to_string()),
        )
        .await
        .expect("sync");
        assert_eq!(outcome["operation_type"], json!("directory_init"));

        let err = trigger_sync(&job_tx, FabricName::from("dc1"), Some("teleport".to_string()))
            .await
            .expect_err("bad op");
        assert!(err.to_string().contains("teleport"));

        drop(job_tx);
        handle_join("sync_processor", processor.await).expect("processor");
    }

    #[tokio::test]
    async fn status_payload_lists_fabric_summaries() {
        let fx = fixture(&["dc1", "dc2"], 4);
        fx.shared
            .in_flight
            .write()
            .await
            .insert(FabricName::from("dc2"));

        let payload = build_status_payload(&fx.shared).await.expect("status");
        assert_eq!(payload["running"], json!(true));
        assert_eq!(payload["started_at_unix"], json!(1_000_000u64));
        assert_eq!(payload["last_tick_unix"], json!(0u64));
        assert_eq!(payload["in_flight"], json!(["dc2"]));

        let fabrics = payload["fabrics"].as_array().expect("fabrics");
        assert_eq!(fabrics.len(), 2);
        assert_eq!(fabrics[0]["fabric"], json!("dc1"));
        assert_eq!(fabrics[0]["sync_status"], json!("never_synced"));
        assert_eq!(fabrics[0]["scheduler_enabled"], json!(true));
    }

    #[tokio::test]
    async fn drift_payload_requires_known_fabric() {
        let fx = fixture(&["dc1"], 4);
        fx.shared
            .orchestrator
            .run(&FabricName::from("dc1"), OperationType::Ingestion, "tester")
            .await
            .expect("ingest");

        let payload = drift_payload(fx.home.path(), FabricName::from("dc1"))
            .await
            .expect("drift");
        assert_eq!(payload["summary"]["total"], json!(1));
        assert_eq!(payload["resources"][0]["drift_status"], json!("desired_only"));

        assert!(drift_payload(fx.home.path(), FabricName::from("nope"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn socket_protocol_round_trip() {
        let fx = fixture(&["dc1"], 4);
        let (client, server) = UnixStream::pair().expect("pair");
        let (job_tx, _job_rx) = mpsc::channel(8);
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);

        let server_task = tokio::spawn(handle_socket_client(
            server,
            fx.shared.clone(),
            job_tx,
            shutdown_tx,
        ));

        let (reader, mut writer) = client.into_split();
        let mut lines = BufReader::new(reader).lines();

        for (request, ok) in [
            (r#"{"cmd":"status"}"#, true),
            (r#"{"cmd":"drift"}"#, false),
            (r#"{"cmd":"cancel","operation":"missing"}"#, true),
            ("not json", false),
            (r#"{"cmd":"warp"}"#, false),
        ] {
            writer
                .write_all(format!("{request}\n").as_bytes())
                .await
                .expect("write");
            let response = lines.next_line().await.expect("read").expect("line");
            let response: DaemonResponse = serde_json::from_str(&response).expect("decode");
            assert_eq!(response.ok, ok, "request {request}");
        }

        writer
            .write_all(b"{\"cmd\":\"stop\"}\n")
            .await
            .expect("stop");
        let response = lines.next_line().await.expect("read").expect("line");
        assert!(response.contains("stopping"));
        tokio::time::timeout(Duration::from_secs(5), shutdown_rx.recv())
            .await
            .expect("shutdown in time")
            .expect("shutdown signal");
        handle_join("socket_client", server_task.await).expect("client");
    }

    #[test]
    fn stale_socket_file_is_removed_before_bind() {
        let home = TempDir::new().expect("home");
        let socket = home.path().join("daemon.sock");
        fs::write(&socket, b"").expect("stale");
        prepare_socket_for_bind(&socket).expect("prepare");
        assert!(!socket.exists());
    }

    #[test]
    fn job_source_maps_to_initiator() {
        assert_eq!(JobSource::Scheduler.initiator(), SCHEDULER_INITIATOR);
        assert_eq!(JobSource::Socket.initiator(), MANUAL_INITIATOR);
    }
}
