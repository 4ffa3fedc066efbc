use std::{
    collections::HashMap,
    io,
    net::{SocketAddr, TcpListener},
    sync::{mpsc, Arc, OnceLock},
    thread::{self, JoinHandle, ThreadId},
    time::Duration,
};

use log::{debug, error, info};
use tokio::{runtime, sync::mpsc::unbounded_channel, task::LocalSet};

use reslink_client::{Host, InfoError};
use reslink_shared::{Directory, InfoQuery, RemoteGateway, ResourceCore, WireMessage};

use crate::{
    config::NodeConfig,
    engine::{Engine, NetQueue, NetTask},
    error::NodeError,
};

/// The core's way out to the network thread
struct NetGateway {
    queue: NetQueue,
    hosts: Arc<HashMap<String, Arc<Host>>>,
    net_thread: OnceLock<ThreadId>,
}

impl RemoteGateway for NetGateway {
    fn send(&self, host: &str, message: WireMessage) {
        let task = NetTask::HostSend {
            host: host.to_string(),
            message: Some(message),
        };
        if self.queue.send(task).is_err() {
            debug!("Network thread is gone, dropping message for '{}'", host);
        }
    }

    fn await_resources(&self, host: &str, timeout: Duration) -> bool {
        let Some(handle) = self.hosts.get(host) else {
            return false;
        };
        if handle.resources_known() {
            return true;
        }
        // The network thread would wait for itself
        if self.net_thread.get() == Some(&thread::current().id()) {
            return false;
        }
        let task = NetTask::HostSend {
            host: host.to_string(),
            message: None,
        };
        if self.queue.send(task).is_err() {
            return false;
        }
        handle.wait_resources(timeout)
    }

    fn wake(&self) {
        let _ = self.queue.send(NetTask::Wake);
    }
}

/// A running reslink process: the resource core plus the network thread
/// serving its hosts and, if configured, its peers.
///
/// Dropping the node stops the network thread.
pub struct Node {
    core: Arc<ResourceCore>,
    hosts: Arc<HashMap<String, Arc<Host>>>,
    queue: NetQueue,
    config: NodeConfig,
    local_addr: Option<SocketAddr>,
    thread: Option<JoinHandle<()>>,
}

impl Node {
    /// Creates the core for `directory` and starts the network thread.
    pub fn start(directory: Arc<Directory>, config: NodeConfig) -> Result<Self, NodeError> {
        config.net.validate()?;

        let core = Arc::new(ResourceCore::new(directory.clone(), &config.net));
        let hosts: Arc<HashMap<String, Arc<Host>>> = Arc::new(
            directory
                .hosts()
                .map(|entry| (entry.id.clone(), Arc::new(Host::new(entry.clone()))))
                .collect(),
        );

        let (listener, local_addr) = match config.listen {
            Some(address) => {
                let (listener, local_addr) =
                    bind_listener(address).map_err(|source| NodeError::Bind { address, source })?;
                (Some(listener), Some(local_addr))
            }
            None => (None, None),
        };

        let runtime = runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(NodeError::Runtime)?;

        let (queue, receiver) = unbounded_channel();
        let gateway = Arc::new(NetGateway {
            queue: queue.clone(),
            hosts: hosts.clone(),
            net_thread: OnceLock::new(),
        });
        core.attach_gateway(gateway.clone());

        let engine = Engine::new(core.clone(), config.net.clone(), &hosts, queue.clone(), receiver);
        let thread = thread::Builder::new()
            .name("net".to_string())
            .spawn(move || {
                let local = LocalSet::new();
                local.block_on(&runtime, engine.run(listener));
            })
            .map_err(NodeError::ThreadSpawn)?;
        let _ = gateway.net_thread.set(thread.thread().id());

        info!(
            "Node '{}' started with {} hosts{}",
            directory.local_host(),
            hosts.len(),
            local_addr
                .map(|address| format!(", listening on {}", address))
                .unwrap_or_default()
        );

        Ok(Self {
            core,
            hosts,
            queue,
            config,
            local_addr,
            thread: Some(thread),
        })
    }

    pub fn core(&self) -> &Arc<ResourceCore> {
        &self.core
    }

    /// Address the node accepts peers on
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn host(&self, id: &str) -> Option<&Arc<Host>> {
        self.hosts.get(id)
    }

    pub fn hosts(&self) -> impl Iterator<Item = &Arc<Host>> {
        self.hosts.values()
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Drops the connection to `host`. It is re-established once there is
    /// something to send.
    pub fn disconnect_host(&self, host: &str) -> Result<(), NodeError> {
        self.submit(NetTask::HostDisconnect {
            host: host.to_string(),
        })
    }

    fn submit(&self, task: NetTask) -> Result<(), NodeError> {
        self.queue.send(task).map_err(|_| NodeError::Stopped)
    }

    // Introspection

    /// State of the resource `uri` as its owner sees it. Blocks up to the
    /// network timeout if the resource lives on another host.
    pub fn remote_info_resource(&self, uri: &str, verbosity: u8) -> Result<String, InfoError> {
        let directory = self.core.directory();
        let resolution = directory.resolve(uri, None);
        let (Some(host), Some(lid)) = (resolution.host(), resolution.lid()) else {
            return Err(InfoError::Failed {
                host: directory.local_host().to_string(),
                detail: format!("'{}' does not name a resource", uri),
            });
        };
        if directory.is_local_host(host) {
            return self.core.local_resource_info(lid, verbosity).ok_or_else(|| InfoError::Failed {
                host: host.to_string(),
                detail: format!("unknown resource '{}'", lid),
            });
        }
        let query = InfoQuery::Resource {
            verbosity,
            lid: lid.to_string(),
        };
        self.remote_info(host, query)
    }

    /// Subscriber table of `host`. Blocks up to the network timeout for a
    /// remote host.
    pub fn remote_info_subscribers(&self, host: &str, verbosity: u8) -> Result<String, InfoError> {
        if self.core.directory().is_local_host(host) {
            return Ok(self.core.subscribers_info(verbosity));
        }
        self.remote_info(host, InfoQuery::Subscribers { verbosity })
    }

    fn remote_info(&self, host: &str, query: InfoQuery) -> Result<String, InfoError> {
        let handle = self.hosts.get(host).ok_or_else(|| InfoError::UnknownHost {
            host: host.to_string(),
        })?;
        handle.remote_info(query, self.config.net.net_timeout, |message| {
            let task = NetTask::HostSend {
                host: host.to_string(),
                message: Some(message),
            };
            if self.queue.send(task).is_err() {
                handle.info_abort();
            }
        })
    }

    /// Status of hosts, peers and subscribers, as seen by the network
    /// thread.
    pub fn info_all(&self, verbosity: u8) -> Result<String, NodeError> {
        let (reply, answer) = mpsc::channel();
        self.submit(NetTask::Info { verbosity, reply })?;
        answer
            .recv_timeout(self.config.net.net_timeout)
            .map_err(|_| NodeError::Stopped)
    }

    // Shutdown

    /// Stops the network thread, waiting for unsent data at most for the
    /// network timeout.
    pub fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        let _ = self.queue.send(NetTask::Exit);
        if thread.join().is_err() {
            error!("Network thread of '{}' panicked", self.core.local_host());
        } else {
            info!("Node '{}' stopped", self.core.local_host());
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.stop();
    }
}

fn bind_listener(address: SocketAddr) -> io::Result<(TcpListener, SocketAddr)> {
    let listener = TcpListener::bind(address)?;
    listener.set_nonblocking(true)?;
    let local_addr = listener.local_addr()?;
    Ok((listener, local_addr))
}
