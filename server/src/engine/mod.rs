//! The network thread: a single-threaded event loop owning every socket
//! of the node.

mod io;
mod task;

pub(crate) use task::{NetQueue, NetTask};

use std::{
    collections::{BTreeMap, HashMap},
    fmt::Write,
    mem,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use log::{debug, error, info, trace, warn};
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    sync::mpsc::UnboundedReceiver,
    task::{spawn_local, JoinHandle},
    time::{sleep, sleep_until, timeout_at},
};

use reslink_client::{connect, ConnectOutcome, Host, HostAction, HostLink, HostOpcode};
use reslink_shared::{NetConfig, ResourceCore, Timestamp, WireMessage};

use crate::connection::{ServerConnection, ServerKey};
use io::{SocketIo, SocketOwner};
use task::AgentSink;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

struct HostSlot {
    link: HostLink,
    handle: Arc<Host>,
    connector: Option<JoinHandle<()>>,
    /// Socket and the connect attempt it came from
    socket: Option<(u64, SocketIo)>,
}

struct ServerSlot {
    connection: ServerConnection,
    socket: Option<SocketIo>,
}

/// State owned by the network thread.
///
/// Every host and server connection is driven from `run`, one task at a
/// time, so their state machines need no locking.
pub(crate) struct Engine {
    core: Arc<ResourceCore>,
    config: NetConfig,
    queue: NetQueue,
    receiver: UnboundedReceiver<NetTask>,
    hosts: HashMap<String, HostSlot>,
    servers: BTreeMap<ServerKey, ServerSlot>,
    next_server: u64,
    /// Writers of closed sockets that may still be flushing
    closing: Vec<JoinHandle<()>>,
}

impl Engine {
    pub fn new(
        core: Arc<ResourceCore>,
        config: NetConfig,
        hosts: &HashMap<String, Arc<Host>>,
        queue: NetQueue,
        receiver: UnboundedReceiver<NetTask>,
    ) -> Self {
        let now = Instant::now();
        let hosts = hosts
            .iter()
            .map(|(id, handle)| {
                let slot = HostSlot {
                    link: HostLink::new(id, &config, now),
                    handle: handle.clone(),
                    connector: None,
                    socket: None,
                };
                (id.clone(), slot)
            })
            .collect();
        Self {
            core,
            config,
            queue,
            receiver,
            hosts,
            servers: BTreeMap::new(),
            next_server: 0,
            closing: Vec::new(),
        }
    }

    /// Runs until `Exit` arrives or every queue sender is gone. Must be
    /// driven inside a `LocalSet`.
    pub async fn run(mut self, listener: Option<std::net::TcpListener>) {
        if let Some(listener) = listener {
            self.spawn_acceptor(listener);
        }
        info!("Network engine of '{}' started", self.core.local_host());

        loop {
            let task = match self.next_deadline() {
                Some(deadline) => select! {
                    task = self.receiver.recv() => Some(task),
                    _ = sleep_until(deadline.into()) => None,
                },
                None => Some(self.receiver.recv().await),
            };
            match task {
                None => self.fire_timers(Instant::now()),
                Some(None) | Some(Some(NetTask::Exit)) => break,
                Some(Some(task)) => self.dispatch(task),
            }
        }

        let deadline = Instant::now() + self.config.net_timeout;
        self.drain(deadline).await;
        self.shutdown(deadline).await;
    }

    /// Keeps the loop running for hosts that still buffer unsent messages,
    /// so pending connects can finish and hand the data to a socket.
    async fn drain(&mut self, deadline: Instant) {
        loop {
            let pending: Vec<&str> = self
                .hosts
                .iter()
                .filter(|(_, slot)| slot.link.has_pending())
                .map(|(id, _)| id.as_str())
                .collect();
            if pending.is_empty() {
                return;
            }
            if Instant::now() >= deadline {
                warn!("Unsent messages for {} dropped at shutdown", pending.join(", "));
                return;
            }
            trace!("Flushing {} before shutdown", pending.join(", "));

            let wake = self.next_deadline().map_or(deadline, |t| t.min(deadline));
            let task = select! {
                task = self.receiver.recv() => Some(task),
                _ = sleep_until(wake.into()) => None,
            };
            match task {
                None => self.fire_timers(Instant::now()),
                Some(None) => return,
                Some(Some(NetTask::Exit)) => {}
                Some(Some(task)) => self.dispatch(task),
            }
        }
    }

    fn dispatch(&mut self, task: NetTask) {
        match task {
            NetTask::HostSend { host, message } => {
                let Some(slot) = self.hosts.get_mut(&host) else {
                    warn!("Dropping message for unknown host '{}'", host);
                    return;
                };
                if let Some(message) = message {
                    slot.link.queue(&message);
                }
                self.host_opcode(&host, HostOpcode::Send);
            }
            NetTask::HostDisconnect { host } => self.host_opcode(&host, HostOpcode::Disconnect),
            NetTask::HostConnected {
                host,
                attempt,
                stream,
                peer,
            } => self.on_host_connected(host, attempt, stream, peer),
            NetTask::HostConnectFailed { host, attempt, error } => {
                let Some(slot) = self.hosts.get_mut(&host) else {
                    return;
                };
                if slot.link.attempt() != attempt {
                    trace!("Ignoring result of stale attempt {} to '{}'", attempt, host);
                    return;
                }
                slot.connector = None;
                debug!("Cannot connect to host '{}': {}", host, error);
                self.host_opcode(&host, HostOpcode::ConnectFailed);
            }
            NetTask::HostData { host, attempt, data } => self.on_host_data(&host, attempt, &data),
            NetTask::HostClosed { host, attempt } => {
                if self.host_socket_attempt(&host) == Some(attempt) {
                    info!("Connection to host '{}' lost", host);
                    self.host_opcode(&host, HostOpcode::Disconnect);
                }
            }
            NetTask::Accepted { stream, peer } => self.on_accepted(stream, peer),
            NetTask::ServerData { server, data } => {
                let Some(slot) = self.servers.get_mut(&server) else {
                    return;
                };
                match slot.connection.on_data(&self.core, &data, Instant::now()) {
                    Ok(()) => self.flush_server(server),
                    Err(e) => {
                        warn!("{}", e);
                        self.disconnect_server(server);
                    }
                }
            }
            NetTask::ServerClosed { server } => self.disconnect_server(server),
            NetTask::ServerEvent {
                server,
                subscriber,
                event,
            } => {
                if let Some(slot) = self.servers.get_mut(&server) {
                    slot.connection.on_subscriber_event(subscriber, &event);
                    self.flush_server(server);
                }
            }
            NetTask::ServerDelete { server } => self.delete_server(server),
            NetTask::Info { verbosity, reply } => {
                let _ = reply.send(self.info(verbosity));
            }
            NetTask::Wake | NetTask::Exit => {}
        }
        self.closing.retain(|writer| !writer.is_finished());
    }

    // Timers

    fn next_deadline(&self) -> Option<Instant> {
        let hosts = self.hosts.values().filter_map(|slot| slot.link.next_deadline());
        let servers = self
            .servers
            .values()
            .filter_map(|slot| slot.connection.next_deadline());
        hosts.chain(servers).chain(self.core.next_expiry()).min()
    }

    fn fire_timers(&mut self, now: Instant) {
        self.core.expire_values(now);

        let due_hosts: Vec<String> = self
            .hosts
            .iter()
            .filter(|(_, slot)| slot.link.next_deadline().is_some_and(|t| t <= now))
            .map(|(id, _)| id.clone())
            .collect();
        for host in due_hosts {
            trace!("Timer of host '{}'", host);
            self.host_opcode(&host, HostOpcode::Timer);
        }

        let due_servers: Vec<ServerKey> = self
            .servers
            .iter()
            .filter(|(_, slot)| slot.connection.next_deadline().is_some_and(|t| t <= now))
            .map(|(key, _)| *key)
            .collect();
        for server in due_servers {
            let Some(slot) = self.servers.get_mut(&server) else {
                continue;
            };
            match slot.connection.on_alive_timer(now) {
                Ok(()) => self.flush_server(server),
                Err(e) => {
                    info!("{}", e);
                    self.disconnect_server(server);
                }
            }
        }
    }

    // Hosts

    fn host_opcode(&mut self, host: &str, opcode: HostOpcode) {
        let now = Instant::now();
        let Some(slot) = self.hosts.get_mut(host) else {
            warn!("Opcode {:?} for unknown host '{}'", opcode, host);
            return;
        };
        let demand =
            self.core.has_remote_demand(host) || slot.link.has_pending() || slot.handle.info_pending();
        let actions = slot.link.handle(opcode, demand, now);
        for action in actions {
            self.execute(host, action);
        }
        if let Some(slot) = self.hosts.get(host) {
            slot.handle.set_state(slot.link.state());
            slot.handle.set_write_pending(slot.link.has_pending());
        }
    }

    fn execute(&mut self, host: &str, action: HostAction) {
        match action {
            HostAction::Connect { attempt } => self.start_connector(host, attempt),
            HostAction::CancelConnect => {
                if let Some(connector) = self.hosts.get_mut(host).and_then(|s| s.connector.take()) {
                    debug!("Cancelling connect to host '{}'", host);
                    connector.abort();
                }
            }
            HostAction::Greet => {
                let mut greeting = String::new();
                WireMessage::Hello {
                    host: self.core.local_host().to_string(),
                }
                .write_to(&mut greeting);
                WireMessage::ListRequest.write_to(&mut greeting);
                for message in self.core.remote_resync(host) {
                    message.write_to(&mut greeting);
                }
                self.write_host(host, greeting);
            }
            HostAction::Write(text) => self.write_host(host, text),
            HostAction::Close => {
                if let Some((_, socket)) = self.hosts.get_mut(host).and_then(|s| s.socket.take()) {
                    self.closing.push(socket.close());
                }
            }
            HostAction::Invalidate => {
                self.core.invalidate_host(host);
                if let Some(slot) = self.hosts.get(host) {
                    slot.handle.info_abort();
                }
            }
            HostAction::RefreshResources => self.write_host(host, WireMessage::ListRequest.encode()),
        }
    }

    fn start_connector(&mut self, host: &str, attempt: u64) {
        let Some(slot) = self.hosts.get_mut(host) else {
            return;
        };
        if let Some(previous) = slot.connector.take() {
            previous.abort();
        }
        debug!("Connecting to host '{}', attempt {}", host, attempt);
        let handle = slot.handle.clone();
        let queue = self.queue.clone();
        let timeout = self.config.net_timeout;
        let host = host.to_string();
        slot.connector = Some(spawn_local(async move {
            let task = match connect(handle, timeout).await {
                ConnectOutcome::Connected { stream, peer } => NetTask::HostConnected {
                    host,
                    attempt,
                    stream,
                    peer,
                },
                ConnectOutcome::Failed { error } => NetTask::HostConnectFailed { host, attempt, error },
            };
            let _ = queue.send(task);
        }));
    }

    fn on_host_connected(&mut self, host: String, attempt: u64, stream: TcpStream, peer: SocketAddr) {
        let Some(slot) = self.hosts.get_mut(&host) else {
            return;
        };
        if slot.link.attempt() != attempt || !slot.link.state().is_connecting() {
            debug!("Dropping stale connection to host '{}' (attempt {})", host, attempt);
            return;
        }
        slot.connector = None;
        if let Some((_, previous)) = slot.socket.take() {
            self.closing.push(previous.close());
        }
        info!("Connected to host '{}' at {}", host, peer);
        let owner = SocketOwner::Host {
            host: host.clone(),
            attempt,
        };
        slot.socket = Some((attempt, SocketIo::spawn(stream, owner, &self.queue)));
        self.host_opcode(&host, HostOpcode::ConnectSuccess);
    }

    fn host_socket_attempt(&self, host: &str) -> Option<u64> {
        self.hosts
            .get(host)
            .and_then(|slot| slot.socket.as_ref())
            .map(|(attempt, _)| *attempt)
    }

    fn on_host_data(&mut self, host: &str, attempt: u64, data: &[u8]) {
        if self.host_socket_attempt(host) != Some(attempt) {
            return;
        }
        let now = Instant::now();
        let Some(slot) = self.hosts.get_mut(host) else {
            return;
        };
        slot.handle.mark_alive(Timestamp::now_or_epoch());
        for line in slot.link.receive(data, now) {
            match line {
                Ok(message) => self.on_host_message(host, message, now),
                Err(e) => {
                    warn!("Host '{}' sent a malformed line: {}", host, e);
                    self.host_opcode(host, HostOpcode::Disconnect);
                    return;
                }
            }
        }
    }

    fn on_host_message(&mut self, host: &str, message: WireMessage, now: Instant) {
        trace!("'{}' -> {}", host, message);
        let Some(slot) = self.hosts.get_mut(host) else {
            return;
        };
        match message {
            WireMessage::Hello { host: id } => {
                if id != host {
                    warn!("Host '{}' introduced itself as '{}'", host, id);
                }
            }
            WireMessage::ResourceInfo { lid, rc_type } => {
                if let Err(e) = self.core.register_remote(host, &lid, rc_type) {
                    warn!("Host '{}' announced an unusable resource: {}", host, e);
                }
            }
            WireMessage::ListEnd => {
                if slot.link.resources_complete(now) {
                    info!("Resource list of host '{}' is complete", host);
                    slot.handle.set_state(slot.link.state());
                }
                slot.handle.set_resources_known();
            }
            WireMessage::Event {
                subscriber,
                lid,
                value,
            } => {
                if let Err(e) = self.core.deliver_remote(host, &subscriber, &lid, &value) {
                    warn!("Host '{}' sent a bad value for '{}': {}", host, lid, e);
                }
            }
            WireMessage::Alive => self.write_host(host, WireMessage::Alive.encode()),
            WireMessage::InfoLine { query_id, text } => slot.handle.info_line(query_id, text),
            WireMessage::InfoEnd { query_id, ok } => slot.handle.info_end(query_id, ok),
            other => warn!("Host '{}' sent unexpected '{}'", host, other),
        }
    }

    fn write_host(&mut self, host: &str, text: String) {
        match self.hosts.get(host).and_then(|slot| slot.socket.as_ref()) {
            Some((_, socket)) => {
                if !socket.write(text) {
                    debug!("Writer of host '{}' is gone", host);
                }
            }
            None => debug!("No socket for host '{}', dropping {} bytes", host, text.len()),
        }
    }

    // Servers

    fn spawn_acceptor(&self, listener: std::net::TcpListener) {
        let listener = match TcpListener::from_std(listener) {
            Ok(listener) => listener,
            Err(e) => {
                error!("Cannot register the listening socket: {}", e);
                return;
            }
        };
        if let Ok(address) = listener.local_addr() {
            info!("Accepting peers on {}", address);
        }
        let queue = self.queue.clone();
        spawn_local(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!("Cannot disable Nagle for {}: {}", peer, e);
                        }
                        if queue.send(NetTask::Accepted { stream, peer }).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        sleep(ACCEPT_BACKOFF).await;
                    }
                }
            }
        });
    }

    fn on_accepted(&mut self, stream: TcpStream, peer: SocketAddr) {
        let key = ServerKey(self.next_server);
        self.next_server += 1;
        info!("Accepted connection from {}", peer);
        let sink = Arc::new(AgentSink::new(key, self.queue.clone()));
        let connection = ServerConnection::new(key, peer, &self.config, sink, Instant::now());
        let socket = SocketIo::spawn(stream, SocketOwner::Server(key), &self.queue);
        self.servers.insert(
            key,
            ServerSlot {
                connection,
                socket: Some(socket),
            },
        );
    }

    fn flush_server(&mut self, server: ServerKey) {
        let Some(slot) = self.servers.get_mut(&server) else {
            return;
        };
        if let (Some(text), Some(socket)) = (slot.connection.take_output(), slot.socket.as_ref()) {
            if !socket.write(text) {
                debug!("Writer of {} is gone", slot.connection.peer());
            }
        }
    }

    fn disconnect_server(&mut self, server: ServerKey) {
        let Some(slot) = self.servers.get_mut(&server) else {
            return;
        };
        if slot.connection.disconnect() {
            let _ = self.queue.send(NetTask::ServerDelete { server });
        }
    }

    fn delete_server(&mut self, server: ServerKey) {
        let Some(mut slot) = self.servers.remove(&server) else {
            return;
        };
        debug!("Deleting connection to {}", slot.connection.peer());
        slot.connection.release(&self.core);
        if let Some(socket) = slot.socket.take() {
            self.closing.push(socket.close());
        }
    }

    // Status

    fn info(&self, verbosity: u8) -> String {
        let mut out = format!("node {}\n", self.core.local_host());
        let mut hosts: Vec<_> = self.hosts.values().collect();
        hosts.sort_by(|a, b| a.handle.id().cmp(b.handle.id()));
        out.push_str("hosts:\n");
        for slot in hosts {
            let _ = writeln!(out, "  {}", slot.handle.info(verbosity).replace('\n', "\n  "));
        }
        out.push_str("servers:\n");
        for slot in self.servers.values() {
            let _ = writeln!(out, "  {}", slot.connection.info(verbosity).replace('\n', "\n  "));
        }
        out.push_str("subscribers:\n");
        for line in self.core.subscribers_info(verbosity).lines() {
            let _ = writeln!(out, "  {}", line);
        }
        out
    }

    async fn shutdown(mut self, deadline: Instant) {
        info!("Network engine of '{}' stopping", self.core.local_host());
        for slot in self.hosts.values_mut() {
            if let Some(connector) = slot.connector.take() {
                connector.abort();
            }
            if let Some((_, socket)) = slot.socket.take() {
                self.closing.push(socket.close());
            }
            slot.handle.info_abort();
        }
        for (_, mut slot) in mem::take(&mut self.servers) {
            slot.connection.release(&self.core);
            if let Some(socket) = slot.socket.take() {
                self.closing.push(socket.close());
            }
        }

        for writer in self.closing.drain(..) {
            if timeout_at(deadline.into(), writer).await.is_err() {
                warn!("Unsent data dropped at shutdown");
                break;
            }
        }
    }
}
