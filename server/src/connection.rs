use std::{
    collections::HashMap,
    fmt::{self, Write},
    mem,
    net::SocketAddr,
    sync::Arc,
    time::Instant,
};

use log::{debug, info, trace, warn};

use reslink_shared::{
    EventSink, InfoQuery, LineBuffer, NetConfig, Request, ResourceCore, ResourceEvent,
    ResourceKey, SubscriberKey, ValueState, WireMessage,
};

use crate::error::ServerError;

/// Identifies a server connection on the network thread
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerKey(pub(crate) u64);

impl ServerKey {
    pub fn to_u64(&self) -> u64 {
        self.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerState {
    /// Accepted, waiting for `hello`
    New,
    Connected,
    Disconnected,
    /// Waiting for the network thread to delete it
    InDeletion,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServerState::New => "new",
            ServerState::Connected => "connected",
            ServerState::Disconnected => "disconnected",
            ServerState::InDeletion => "in-deletion",
        };
        f.write_str(name)
    }
}

/// Serves one peer that connected to this node.
///
/// Remote subscribers are represented by agent subscribers in the core,
/// all sharing the connection's event sink; their events come back through
/// `on_subscriber_event`. Like `HostLink` it does no I/O itself: the engine
/// feeds bytes in and writes whatever `take_output` returns.
pub struct ServerConnection {
    key: ServerKey,
    peer: SocketAddr,
    remote_host: Option<String>,
    state: ServerState,
    config: NetConfig,
    sink: Arc<dyn EventSink>,
    // Agents by remote subscriber id
    agents: HashMap<String, SubscriberKey>,
    receive_buffer: LineBuffer,
    send_buffer: String,
    last_heard: Instant,
    t_alive: Instant,
}

impl ServerConnection {
    pub fn new(
        key: ServerKey,
        peer: SocketAddr,
        config: &NetConfig,
        sink: Arc<dyn EventSink>,
        now: Instant,
    ) -> Self {
        Self {
            key,
            peer,
            remote_host: None,
            state: ServerState::New,
            config: config.clone(),
            sink,
            agents: HashMap::new(),
            receive_buffer: LineBuffer::new(),
            send_buffer: String::new(),
            last_heard: now,
            t_alive: now + config.alive_interval,
        }
    }

    pub fn key(&self) -> ServerKey {
        self.key
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Host id the peer introduced itself with
    pub fn remote_host(&self) -> Option<&str> {
        self.remote_host.as_deref()
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    pub fn agent(&self, subscriber: &str) -> Option<SubscriberKey> {
        self.agents.get(subscriber).copied()
    }

    fn is_open(&self) -> bool {
        matches!(self.state, ServerState::New | ServerState::Connected)
    }

    // Incoming data

    /// Feeds bytes read from the socket and handles every complete line.
    ///
    /// Non-fatal problems are logged and skipped; the first fatal one is
    /// returned and the caller should disconnect.
    pub fn on_data(&mut self, core: &ResourceCore, bytes: &[u8], now: Instant) -> Result<(), ServerError> {
        if !self.is_open() {
            return Ok(());
        }
        self.last_heard = now;
        self.receive_buffer.extend(bytes);
        for line in self.receive_buffer.drain_messages() {
            let message = line.map_err(|source| ServerError::Protocol {
                peer: self.peer,
                source,
            })?;
            trace!("{} -> {}", self.peer, message);
            match self.on_message(core, message) {
                Ok(()) => {}
                Err(error) if error.is_fatal() => return Err(error),
                Err(error) => warn!("{}", error),
            }
        }
        Ok(())
    }

    pub fn on_message(&mut self, core: &ResourceCore, message: WireMessage) -> Result<(), ServerError> {
        if self.state == ServerState::New {
            let host = match message {
                WireMessage::Hello { host } => host,
                other => {
                    return Err(ServerError::HelloExpected {
                        peer: self.peer,
                        command: command_of(&other),
                    })
                }
            };
            info!("Peer {} identified as host '{}'", self.peer, host);
            self.remote_host = Some(host);
            self.state = ServerState::Connected;
            self.queue(&WireMessage::Hello {
                host: core.local_host().to_string(),
            });
            return Ok(());
        }

        match message {
            WireMessage::Hello { host } => {
                debug!("Peer {} repeated hello as '{}'", self.peer, host);
            }
            WireMessage::ListRequest => {
                for (lid, rc_type) in core.local_resources() {
                    self.queue(&WireMessage::ResourceInfo { lid, rc_type });
                }
                self.queue(&WireMessage::ListEnd);
            }
            WireMessage::Subscribe { subscriber, lid } => self.subscribe(core, subscriber, &lid),
            WireMessage::Unsubscribe { subscriber, lid } => self.unsubscribe(core, &subscriber, &lid),
            WireMessage::SetRequest {
                lid,
                id,
                priority,
                t1,
                value,
            } => {
                let resource = self.local_resource(core, &lid)?;
                let rc_type = core
                    .resource_type(resource)
                    .ok_or_else(|| self.unknown_resource(&lid))?;
                let value = ValueState::decode(rc_type, &value)
                    .map_err(|e| self.invalid_request(&lid, e.to_string()))?;
                let Some(value) = value.value().cloned() else {
                    return Err(self.invalid_request(&lid, "request without value".to_string()));
                };
                let mut request = Request::new(&id, value).with_priority(priority);
                if let Some(t1) = t1 {
                    request = request.with_expiry(t1);
                }
                core.set_request(resource, request)
                    .map_err(|e| self.invalid_request(&lid, e.to_string()))?;
            }
            WireMessage::DelRequest { lid, id, t1 } => {
                let resource = self.local_resource(core, &lid)?;
                core.del_request(resource, &id, t1)
                    .map_err(|e| self.invalid_request(&lid, e.to_string()))?;
            }
            WireMessage::InfoRequest { query_id, query } => self.answer_info(core, query_id, query),
            // Activity is already recorded by `on_data`
            WireMessage::Alive => {}
            other @ (WireMessage::ResourceInfo { .. }
            | WireMessage::ListEnd
            | WireMessage::Event { .. }
            | WireMessage::InfoLine { .. }
            | WireMessage::InfoEnd { .. }) => {
                return Err(ServerError::Unexpected {
                    peer: self.peer,
                    command: command_of(&other),
                });
            }
        }
        Ok(())
    }

    fn subscribe(&mut self, core: &ResourceCore, subscriber: String, lid: &str) {
        let agent = match self.agents.get(&subscriber) {
            Some(agent) => *agent,
            None => {
                let peer = self
                    .remote_host
                    .clone()
                    .unwrap_or_else(|| self.peer.to_string());
                match core.new_agent(&subscriber, &peer, self.sink.clone()) {
                    Ok(agent) => {
                        self.agents.insert(subscriber.clone(), agent);
                        agent
                    }
                    Err(e) => {
                        warn!("Peer {}: cannot create agent '{}': {}", self.peer, subscriber, e);
                        return;
                    }
                }
            }
        };
        let uri = format!("/host/{}/{}", core.local_host(), lid);
        if let Err(e) = core.subscribe(agent, &uri, false) {
            warn!("Peer {}: subscribe of '{}' failed: {}", self.peer, subscriber, e);
        }
    }

    fn unsubscribe(&mut self, core: &ResourceCore, subscriber: &str, lid: &str) {
        let Some(agent) = self.agents.get(subscriber).copied() else {
            debug!("Peer {}: unsubscribe for unknown agent '{}'", self.peer, subscriber);
            return;
        };
        let uri = format!("/host/{}/{}", core.local_host(), lid);
        if let Err(e) = core.unsubscribe(agent, &uri) {
            warn!("Peer {}: unsubscribe of '{}' failed: {}", self.peer, subscriber, e);
        }
        if core.subscriber_resources(agent).is_empty() && core.watch_patterns(agent).is_empty() {
            self.agents.remove(subscriber);
            let _ = core.drop_subscriber(agent);
            debug!("Peer {}: dropped idle agent '{}'", self.peer, subscriber);
        }
    }

    fn answer_info(&mut self, core: &ResourceCore, query_id: u64, query: InfoQuery) {
        let (text, ok) = match query {
            InfoQuery::Resource { verbosity, lid } => match core.local_resource_info(&lid, verbosity) {
                Some(text) => (text, true),
                None => (format!("unknown resource '{}'", lid), false),
            },
            InfoQuery::Subscribers { verbosity } => (core.subscribers_info(verbosity), true),
        };
        for line in text.lines() {
            self.queue(&WireMessage::InfoLine {
                query_id,
                text: line.to_string(),
            });
        }
        self.queue(&WireMessage::InfoEnd { query_id, ok });
    }

    fn local_resource(&self, core: &ResourceCore, lid: &str) -> Result<ResourceKey, ServerError> {
        let uri = format!("/host/{}/{}", core.local_host(), lid);
        core.get_resource(&uri, false)
            .ok_or_else(|| self.unknown_resource(lid))
    }

    fn unknown_resource(&self, lid: &str) -> ServerError {
        ServerError::UnknownResource {
            peer: self.peer,
            lid: lid.to_string(),
        }
    }

    fn invalid_request(&self, lid: &str, reason: String) -> ServerError {
        ServerError::InvalidRequest {
            peer: self.peer,
            lid: lid.to_string(),
            reason,
        }
    }

    // Outgoing data

    /// Serializes an event of one of this connection's agents.
    pub fn on_subscriber_event(&mut self, subscriber: SubscriberKey, event: &ResourceEvent) {
        if self.state != ServerState::Connected {
            return;
        }
        let Some(gid) = self
            .agents
            .iter()
            .find(|(_, agent)| **agent == subscriber)
            .map(|(gid, _)| gid.clone())
        else {
            trace!("Peer {}: event for a dropped agent", self.peer);
            return;
        };
        self.queue(&WireMessage::Event {
            subscriber: gid,
            lid: event.lid.clone(),
            value: event.value_state.encode(),
        });
    }

    fn queue(&mut self, message: &WireMessage) {
        trace!("{} <- {}", self.peer, message);
        message.write_to(&mut self.send_buffer);
    }

    /// Data to write to the socket, if any
    pub fn take_output(&mut self) -> Option<String> {
        if self.send_buffer.is_empty() {
            return None;
        }
        Some(mem::take(&mut self.send_buffer))
    }

    // Timers

    pub fn next_deadline(&self) -> Option<Instant> {
        if !self.is_open() {
            return None;
        }
        Some(self.t_alive.min(self.last_heard + self.config.alive_timeout))
    }

    /// Sends the periodic `alive` and checks that the peer is still there.
    pub fn on_alive_timer(&mut self, now: Instant) -> Result<(), ServerError> {
        if !self.is_open() {
            return Ok(());
        }
        if now >= self.last_heard + self.config.alive_timeout {
            return Err(ServerError::AliveTimeout {
                peer: self.peer,
                timeout_ms: self.config.alive_timeout.as_millis(),
            });
        }
        if now >= self.t_alive {
            self.t_alive = now + self.config.alive_interval;
            if self.state == ServerState::Connected {
                self.queue(&WireMessage::Alive);
            }
        }
        Ok(())
    }

    // Teardown

    /// Marks the connection for deletion. Returns true the first time, when
    /// the caller has to schedule the deletion.
    pub fn disconnect(&mut self) -> bool {
        if self.state == ServerState::InDeletion {
            return false;
        }
        info!("Closing connection to {}", self.peer);
        self.state = ServerState::InDeletion;
        self.send_buffer.clear();
        true
    }

    /// Drops all agents. Called by the network thread when deleting.
    pub fn release(&mut self, core: &ResourceCore) {
        for (gid, agent) in self.agents.drain() {
            if let Err(e) = core.drop_subscriber(agent) {
                debug!("Agent '{}' already gone: {}", gid, e);
            }
        }
        if self.state != ServerState::InDeletion {
            self.state = ServerState::Disconnected;
        }
    }

    pub fn info(&self, verbosity: u8) -> String {
        let mut out = format!(
            "{} {} {} agents={}",
            self.peer,
            self.remote_host.as_deref().unwrap_or("-"),
            self.state,
            self.agents.len()
        );
        if verbosity >= 1 {
            let mut gids: Vec<_> = self.agents.keys().collect();
            gids.sort();
            for gid in gids {
                let _ = write!(out, "\n  agent {}", gid);
            }
        }
        out
    }
}

fn command_of(message: &WireMessage) -> String {
    let line = message.to_string();
    line.split(' ').next().unwrap_or_default().to_string()
}
