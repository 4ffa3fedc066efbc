mod handle;
mod link;
mod state;

pub use handle::{ConnectorInfo, Host};
pub use link::HostLink;
pub use state::{HostAction, HostOpcode, HostState};
