//! Long-running scheduler daemon: periodic tick + sync processor + control socket.

mod error;
pub mod paths;
pub mod protocol;
mod runtime;
pub mod scheduler;
pub mod settings;

pub use error::DaemonError;
pub use protocol::{
    request_cancel, request_drift, request_status, request_stop, request_sync, send_request,
    DaemonRequest, DaemonResponse,
};
pub use runtime::{run, start_blocking, InFlight, MANUAL_INITIATOR};
pub use scheduler::{plan_tick, Dispatch, TickPlan};
pub use settings::DaemonSettings;
