//! # Reslink Server
//! The serving side of a reslink process and the network thread that ties
//! everything together: peers that connect to this node are served by a
//! `ServerConnection`, remote hosts are reached through the client crate's
//! `HostLink`, and both are driven by one cooperative event loop owned by
//! a `Node`.

#![deny(
    trivial_casts,
    trivial_numeric_casts,
    unstable_features,
    unused_import_braces
)]

mod config;
mod connection;
mod engine;
mod error;
mod node;

pub use config::NodeConfig;
pub use connection::{ServerConnection, ServerKey, ServerState};
pub use error::{NodeError, ServerError};
pub use node::Node;

pub mod shared {
    pub use reslink_shared::{
        Directory, DirectoryConfig, EventSink, NetConfig, Request, ResourceCore, ResourceEvent,
        ResourceKey, SubscriberKey, Value, ValueState,
    };
}
