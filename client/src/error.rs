use thiserror::Error;

/// Errors returned by blocking introspection queries to a remote host
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InfoError {
    /// No answer within the network timeout
    #[error("Host '{host}' did not answer within {timeout_ms} ms")]
    Timeout {
        host: String,
        timeout_ms: u128,
    },

    /// Connection lost before the answer was complete
    #[error("Connection to host '{host}' was lost before the answer arrived")]
    Disconnected {
        host: String,
    },

    /// Only one query per host may be in flight
    #[error("Another info request to host '{host}' is still running")]
    Busy {
        host: String,
    },

    /// The host answered with an error
    #[error("Host '{host}' could not answer: {detail}")]
    Failed {
        host: String,
        detail: String,
    },

    /// Host id not found in the directory
    #[error("Host '{host}' is not registered in the directory")]
    UnknownHost {
        host: String,
    },
}
