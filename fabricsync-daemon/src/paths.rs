use std::path::{Path, PathBuf};

use fabricsync_core::registry::state_root;

pub const DAEMON_LABEL: &str = "dev.fabricsync.daemon";

pub const DAEMON_SOCKET: &str = "daemon.sock";
pub const DAEMON_SETTINGS: &str = "daemon.yaml";

pub fn run_dir(home: &Path) -> PathBuf {
    state_root(home).join("run")
}

pub fn socket_path(home: &Path) -> PathBuf {
    run_dir(home).join(DAEMON_SOCKET)
}

pub fn settings_path(home: &Path) -> PathBuf {
    state_root(home).join(DAEMON_SETTINGS)
}

pub fn logs_dir(home: &Path) -> PathBuf {
    state_root(home).join("logs")
}
