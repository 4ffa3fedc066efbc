use std::{default::Default, time::Duration};

use crate::error::ConfigError;

/// Timing parameters of the resource network
#[derive(Clone, Debug)]
pub struct NetConfig {
    /// Upper bound for a single connect attempt, for blocking info queries,
    /// for waits on a remote host's resource list and for the flush of
    /// unsent data at shutdown.
    pub net_timeout: Duration,
    /// Delay before the first reconnect after a failed attempt. Each
    /// further failure doubles the delay.
    pub retry_min: Duration,
    /// Ceiling for the reconnect delay
    pub retry_max: Duration,
    /// A host that could not be reached for this long stops retrying and
    /// waits in standby until new demand arrives. Hosts whose resource list
    /// is still unknown never give up.
    pub retry_give_up: Duration,
    /// A connection without subscriptions, requests or traffic is closed
    /// after this time.
    pub idle_timeout: Duration,
    /// Interval at which a connected host's resource list is fetched again
    pub age_interval: Duration,
    /// Interval at which servers send keep-alive lines
    pub alive_interval: Duration,
    /// A connection on which nothing was received for this long is
    /// considered dead.
    pub alive_timeout: Duration,
}

impl NetConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let intervals = [
            ("net_timeout", self.net_timeout),
            ("retry_min", self.retry_min),
            ("retry_max", self.retry_max),
            ("idle_timeout", self.idle_timeout),
            ("age_interval", self.age_interval),
            ("alive_interval", self.alive_interval),
            ("alive_timeout", self.alive_timeout),
        ];
        for (name, interval) in intervals {
            if interval.is_zero() {
                return Err(ConfigError::ZeroInterval { name });
            }
        }
        if self.retry_max < self.retry_min {
            return Err(ConfigError::RetryBounds {
                min_ms: self.retry_min.as_millis(),
                max_ms: self.retry_max.as_millis(),
            });
        }
        Ok(())
    }
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            net_timeout: Duration::from_secs(3),
            retry_min: Duration::from_secs(1),
            retry_max: Duration::from_secs(60),
            retry_give_up: Duration::from_secs(600),
            idle_timeout: Duration::from_secs(30),
            age_interval: Duration::from_secs(600),
            alive_interval: Duration::from_secs(10),
            alive_timeout: Duration::from_secs(30),
        }
    }
}

/// A peer as listed in the host table
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostEntry {
    pub id: String,
    /// Host name or IP address
    pub address: String,
    pub port: u16,
}

impl HostEntry {
    pub fn new(id: &str, address: &str, port: u16) -> Self {
        Self {
            id: id.to_string(),
            address: address.to_string(),
            port,
        }
    }

    /// `address:port`, as handed to the resolver
    pub fn net_address(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// Static directory content, read once before the core starts
#[derive(Clone, Debug)]
pub struct DirectoryConfig {
    /// Id of this process in the resource network
    pub local_host_id: String,
    /// Remote peers. An entry for the local host id is ignored.
    pub hosts: Vec<HostEntry>,
    /// Drivers running in this process
    pub drivers: Vec<String>,
    /// Alias path (below `/alias`, or relative to it) and target URI
    pub aliases: Vec<(String, String)>,
    /// Snapshot served as `/env/<key>` pseudo-resources
    pub env: Vec<(String, String)>,
    /// Base for relative paths
    pub work_dir: String,
}

impl DirectoryConfig {
    pub fn new(local_host_id: &str) -> Self {
        Self {
            local_host_id: local_host_id.to_string(),
            ..Self::default()
        }
    }

    pub fn with_host(mut self, id: &str, address: &str, port: u16) -> Self {
        self.hosts.push(HostEntry::new(id, address, port));
        self
    }

    pub fn with_driver(mut self, id: &str) -> Self {
        self.drivers.push(id.to_string());
        self
    }

    pub fn with_alias(mut self, alias: &str, target: &str) -> Self {
        self.aliases.push((alias.to_string(), target.to_string()));
        self
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            local_host_id: "localhost".to_string(),
            hosts: Vec::new(),
            drivers: Vec::new(),
            aliases: Vec::new(),
            env: Vec::new(),
            work_dir: "/alias".to_string(),
        }
    }
}
