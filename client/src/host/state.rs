use std::fmt;

/// Connection state of a host.
///
/// The `New*` states mean that the host's complete resource list has not
/// been received yet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HostState {
    NewConnecting,
    NewRetryWait,
    NewConnected,
    Connecting,
    RetryWait,
    Connected,
    Standby,
}

impl HostState {
    pub fn is_new(&self) -> bool {
        matches!(
            self,
            HostState::NewConnecting | HostState::NewRetryWait | HostState::NewConnected
        )
    }

    /// The state without its `New` marker
    pub fn base(&self) -> HostState {
        match self {
            HostState::NewConnecting => HostState::Connecting,
            HostState::NewRetryWait => HostState::RetryWait,
            HostState::NewConnected => HostState::Connected,
            other => *other,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.base() == HostState::Connected
    }

    pub fn is_connecting(&self) -> bool {
        self.base() == HostState::Connecting
    }

    /// Moves to `base`, keeping the `New` marker of the current state.
    pub(crate) fn with_base(&self, base: HostState) -> HostState {
        if !self.is_new() {
            return base;
        }
        match base {
            HostState::Connecting => HostState::NewConnecting,
            HostState::RetryWait => HostState::NewRetryWait,
            HostState::Connected => HostState::NewConnected,
            // A host never parks before its resource list is known
            HostState::Standby => HostState::NewRetryWait,
            other => other,
        }
    }

    pub(crate) fn to_u8(self) -> u8 {
        match self {
            HostState::NewConnecting => 0,
            HostState::NewRetryWait => 1,
            HostState::NewConnected => 2,
            HostState::Connecting => 3,
            HostState::RetryWait => 4,
            HostState::Connected => 5,
            HostState::Standby => 6,
        }
    }

    pub(crate) fn from_u8(value: u8) -> HostState {
        match value {
            0 => HostState::NewConnecting,
            1 => HostState::NewRetryWait,
            2 => HostState::NewConnected,
            3 => HostState::Connecting,
            4 => HostState::RetryWait,
            5 => HostState::Connected,
            _ => HostState::Standby,
        }
    }
}

impl fmt::Display for HostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HostState::NewConnecting => "new-connecting",
            HostState::NewRetryWait => "new-retry-wait",
            HostState::NewConnected => "new-connected",
            HostState::Connecting => "connecting",
            HostState::RetryWait => "retry-wait",
            HostState::Connected => "connected",
            HostState::Standby => "standby",
        };
        f.write_str(name)
    }
}

/// Inputs of the host state machine
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostOpcode {
    /// Data is waiting to be sent: connect if needed, then flush
    Send,
    /// I/O error or explicit request to drop the connection
    Disconnect,
    /// Check retry, idle, age and alive deadlines
    Timer,
    /// The connector of the current attempt succeeded
    ConnectSuccess,
    /// The connector of the current attempt failed
    ConnectFailed,
}

/// Work the network engine has to carry out for the state machine
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HostAction {
    /// Start a connector for this attempt
    Connect { attempt: u64 },
    /// Abandon the running connector
    CancelConnect,
    /// Fresh connection: send hello, request the resource list and re-send
    /// subscriptions and requests
    Greet,
    /// Write these bytes to the socket
    Write(String),
    /// Close the socket
    Close,
    /// Mark the host's resources unknown
    Invalidate,
    /// Fetch the resource list again
    RefreshResources,
}
