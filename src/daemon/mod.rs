pub mod lifecycle;
pub mod protocol;
pub mod server;

pub use protocol::{DaemonRequest, DaemonResponse, MonitorCommand, MonitorResponse, RequestType};
pub use server::{run, DaemonState};
