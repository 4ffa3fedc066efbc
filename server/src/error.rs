use std::{io, net::SocketAddr};

use thiserror::Error;

use reslink_shared::{ConfigError, WireError};

/// Errors that keep a node from starting
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Cannot listen on {address}: {source}")]
    Bind {
        address: SocketAddr,
        source: io::Error,
    },

    #[error("Cannot create the network runtime: {0}")]
    Runtime(io::Error),

    #[error("Cannot spawn the network thread: {0}")]
    ThreadSpawn(io::Error),

    /// The network thread is gone
    #[error("The network thread has stopped")]
    Stopped,

    #[error("Invalid network configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Errors raised while serving a peer. Fatal ones end the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServerError {
    #[error("Malformed line from {peer}: {source}")]
    Protocol { peer: SocketAddr, source: WireError },

    #[error("{peer} sent '{command}' before 'hello'")]
    HelloExpected { peer: SocketAddr, command: String },

    /// Lines only a server sends
    #[error("{peer} sent unexpected '{command}'")]
    Unexpected { peer: SocketAddr, command: String },

    #[error("{peer} has been silent for {timeout_ms} ms")]
    AliveTimeout { peer: SocketAddr, timeout_ms: u128 },

    #[error("{peer} addressed unknown resource '{lid}'")]
    UnknownResource { peer: SocketAddr, lid: String },

    #[error("{peer} sent an unusable request for '{lid}': {reason}")]
    InvalidRequest {
        peer: SocketAddr,
        lid: String,
        reason: String,
    },
}

impl ServerError {
    /// Whether the connection has to be dropped
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ServerError::Protocol { .. }
                | ServerError::HelloExpected { .. }
                | ServerError::Unexpected { .. }
                | ServerError::AliveTimeout { .. }
        )
    }
}
