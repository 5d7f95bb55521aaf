//! `fabricsync daemon`: scheduler daemon lifecycle and control.

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use serde_json::Value;

use fabricsync_core::types::OperationType;
use fabricsync_daemon::paths::socket_path;
use fabricsync_daemon::{
    request_cancel, request_status, request_stop, request_sync, start_blocking, DaemonError,
};

use super::home;
use super::sync::Direction;

#[derive(Subcommand, Debug)]
pub enum DaemonCommand {
    /// Run the daemon in the foreground (scheduler + socket server).
    Start,
    /// Request graceful daemon shutdown over the Unix socket.
    Stop,
    /// Query daemon runtime status over the Unix socket.
    Status,
    /// Ask the running daemon to sync one fabric now.
    Sync(DaemonSyncArgs),
    /// Request cancellation of an in-flight operation.
    Cancel(DaemonCancelArgs),
}

#[derive(Args, Debug)]
pub struct DaemonSyncArgs {
    pub fabric: String,

    #[arg(long, value_enum)]
    pub direction: Option<Direction>,
}

#[derive(Args, Debug)]
pub struct DaemonCancelArgs {
    /// Operation id as printed by `sync` or the journal.
    pub operation: String,
}

pub fn run(command: DaemonCommand) -> Result<()> {
    let home = home()?;

    match command {
        DaemonCommand::Start => {
            start_blocking(&home).context("daemon exited with error")?;
        }
        DaemonCommand::Stop => match request_stop(&home) {
            Ok(()) => println!("daemon stop requested"),
            Err(DaemonError::DaemonNotRunning { .. }) => {
                println!("daemon is not running");
            }
            Err(err) => return Err(err).context("failed to stop daemon"),
        },
        DaemonCommand::Status => match request_status(&home) {
            Ok(status) => print_json(&status)?,
            Err(DaemonError::DaemonNotRunning { .. }) => {
                print_json(&serde_json::json!({
                    "running": false,
                    "socket": socket_path(&home).display().to_string(),
                }))?;
            }
            Err(err) => return Err(err).context("failed to query daemon status"),
        },
        DaemonCommand::Sync(args) => {
            let operation = args.direction.map(|d| OperationType::from(d).to_string());
            let op = request_sync(&home, &args.fabric, operation)
                .with_context(|| format!("daemon sync failed for '{}'", args.fabric))?;
            print_json(&op)?;
        }
        DaemonCommand::Cancel(args) => {
            let outcome = request_cancel(&home, &args.operation)
                .context("failed to request cancellation")?;
            print_json(&outcome)?;
        }
    }

    Ok(())
}

fn print_json(value: &Value) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("failed to render daemon JSON")?
    );
    Ok(())
}
