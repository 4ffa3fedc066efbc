use std::{default::Default, net::SocketAddr};

use reslink_shared::NetConfig;

/// Contains Config properties which will be used by a Node
#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// Timing of host and server connections
    pub net: NetConfig,
    /// Address to accept peers on. `None` runs the node as a pure client;
    /// port 0 picks a free port (see `Node::local_addr`).
    pub listen: Option<SocketAddr>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            net: NetConfig::default(),
            listen: None,
        }
    }
}
