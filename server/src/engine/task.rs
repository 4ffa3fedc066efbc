use std::{net::SocketAddr, sync::mpsc::Sender};

use log::trace;
use tokio::{net::TcpStream, sync::mpsc::UnboundedSender};

use reslink_shared::{EventSink, ResourceEvent, SubscriberKey, WireMessage};

use crate::connection::ServerKey;

/// Sending side of the engine queue; usable from any thread
pub(crate) type NetQueue = UnboundedSender<NetTask>;

/// Work items of the network thread, handled in FIFO order
pub(crate) enum NetTask {
    // Hosts
    /// Queue `message` (if any) and make sure the host gets connected
    HostSend {
        host: String,
        message: Option<WireMessage>,
    },
    HostDisconnect {
        host: String,
    },
    HostConnected {
        host: String,
        attempt: u64,
        stream: TcpStream,
        peer: SocketAddr,
    },
    HostConnectFailed {
        host: String,
        attempt: u64,
        error: String,
    },
    HostData {
        host: String,
        attempt: u64,
        data: Vec<u8>,
    },
    HostClosed {
        host: String,
        attempt: u64,
    },

    // Servers
    Accepted {
        stream: TcpStream,
        peer: SocketAddr,
    },
    ServerData {
        server: ServerKey,
        data: Vec<u8>,
    },
    ServerClosed {
        server: ServerKey,
    },
    ServerEvent {
        server: ServerKey,
        subscriber: SubscriberKey,
        event: ResourceEvent,
    },
    ServerDelete {
        server: ServerKey,
    },

    // Node
    Info {
        verbosity: u8,
        reply: Sender<String>,
    },
    /// Nothing to do but recompute the next timer
    Wake,
    Exit,
}

/// Event sink shared by all agents of one server connection
pub(crate) struct AgentSink {
    server: ServerKey,
    queue: NetQueue,
}

impl AgentSink {
    pub fn new(server: ServerKey, queue: NetQueue) -> Self {
        Self { server, queue }
    }
}

impl EventSink for AgentSink {
    fn on_event(&self, subscriber: SubscriberKey, event: ResourceEvent) {
        let task = NetTask::ServerEvent {
            server: self.server,
            subscriber,
            event,
        };
        if self.queue.send(task).is_err() {
            trace!("Network thread is gone, dropping agent event");
        }
    }
}
