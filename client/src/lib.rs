//! # Reslink Client
//! The host side of a reslink process: one connection state machine per
//! remote peer, the thread-safe handles other threads use to look at and
//! query those peers, and the asynchronous connector.

#![deny(trivial_numeric_casts, unstable_features, unused_import_braces)]

mod connector;
mod error;
mod host;

pub use connector::{connect, ConnectOutcome};
pub use error::InfoError;
pub use host::{ConnectorInfo, Host, HostAction, HostLink, HostOpcode, HostState};
