use std::{net::SocketAddr, sync::Arc, time::Duration};

use reslink_server::{Node, NodeConfig};
use reslink_shared::{Directory, DirectoryConfig, NetConfig, ResourceCore, SubscriberKey};

use crate::helpers::EventRecorder;

/// Routes `log` output through the test harness. Safe to call from every
/// test.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Timings short enough for loopback tests
pub fn fast_net_config() -> NetConfig {
    NetConfig {
        net_timeout: Duration::from_secs(2),
        retry_min: Duration::from_millis(50),
        retry_max: Duration::from_millis(400),
        retry_give_up: Duration::from_secs(5),
        idle_timeout: Duration::from_secs(5),
        age_interval: Duration::from_secs(60),
        alive_interval: Duration::from_millis(500),
        alive_timeout: Duration::from_secs(5),
    }
}

/// Builds nodes on the loopback interface
pub struct TestNode {
    directory: DirectoryConfig,
    net: NetConfig,
    listen: bool,
}

impl TestNode {
    pub fn builder(id: &str) -> Self {
        Self {
            directory: DirectoryConfig::new(id),
            net: fast_net_config(),
            listen: false,
        }
    }

    pub fn driver(mut self, id: &str) -> Self {
        self.directory = self.directory.with_driver(id);
        self
    }

    /// Adds a host table entry for a node listening on `address`
    pub fn peer(mut self, id: &str, address: SocketAddr) -> Self {
        self.directory = self
            .directory
            .with_host(id, &address.ip().to_string(), address.port());
        self
    }

    pub fn alias(mut self, alias: &str, target: &str) -> Self {
        self.directory = self.directory.with_alias(alias, target);
        self
    }

    /// Accept peers on an ephemeral port, see `Node::local_addr`
    pub fn listening(mut self) -> Self {
        self.listen = true;
        self
    }

    pub fn net(mut self, net: NetConfig) -> Self {
        self.net = net;
        self
    }

    pub fn start(self) -> Node {
        init_logging();
        let directory = Arc::new(Directory::new(self.directory).expect("valid test directory"));
        let config = NodeConfig {
            net: self.net,
            listen: self.listen.then(|| SocketAddr::from(([127, 0, 0, 1], 0))),
        };
        Node::start(directory, config).expect("node starts")
    }
}

/// Creates a local subscriber that records its events
pub fn subscriber(core: &ResourceCore, name: &str) -> (SubscriberKey, Arc<EventRecorder>) {
    let recorder = Arc::new(EventRecorder::new());
    let key = core
        .new_subscriber(name, recorder.clone())
        .expect("subscriber name is free");
    (key, recorder)
}
