use std::collections::{BTreeMap, BTreeSet};

use log::debug;

use crate::{
    config::{DirectoryConfig, HostEntry},
    error::DirectoryError,
    path::{is_plain_segment, normalize},
};

/// Top-level segments of a URI
pub const ROOTS: [&str; 4] = ["alias", "env", "host", "local"];

const ALIAS_ROOT: &str = "/alias";

/// Host table, driver table, alias table and environment snapshot.
///
/// Built once from a `DirectoryConfig` and never mutated afterwards; the
/// rest of the system shares it behind an `Arc` and reads it without
/// locking.
#[derive(Debug)]
pub struct Directory {
    local_host: String,
    hosts: BTreeMap<String, HostEntry>,
    drivers: BTreeSet<String>,
    aliases: BTreeMap<String, String>,
    env: BTreeMap<String, String>,
    work_dir: String,
}

impl Directory {
    pub fn new(config: DirectoryConfig) -> Result<Self, DirectoryError> {
        if !is_plain_segment(&config.local_host_id) {
            return Err(DirectoryError::InvalidHostId {
                id: config.local_host_id,
            });
        }
        if !config.work_dir.starts_with('/') {
            return Err(DirectoryError::InvalidWorkDir {
                path: config.work_dir,
            });
        }
        let work_dir = normalize(&config.work_dir, "/").into_owned();

        let mut hosts = BTreeMap::new();
        for entry in config.hosts {
            if !is_plain_segment(&entry.id) {
                return Err(DirectoryError::InvalidHostId { id: entry.id });
            }
            if entry.id == config.local_host_id {
                debug!("Ignoring host table entry for the local host '{}'", entry.id);
                continue;
            }
            if hosts.contains_key(&entry.id) {
                return Err(DirectoryError::DuplicateHost { id: entry.id });
            }
            hosts.insert(entry.id.clone(), entry);
        }

        let mut drivers = BTreeSet::new();
        for driver in config.drivers {
            if !is_plain_segment(&driver) {
                return Err(DirectoryError::InvalidDriverId { id: driver });
            }
            drivers.insert(driver);
        }

        let mut aliases = BTreeMap::new();
        for (key, target) in config.aliases {
            let path = normalize(&key, ALIAS_ROOT);
            let path = path.trim_end_matches('/');
            if !path.starts_with("/alias/") {
                return Err(DirectoryError::InvalidAlias { key });
            }
            let target = normalize(&target, ALIAS_ROOT).into_owned();
            aliases.insert(path.to_string(), target);
        }

        Ok(Self {
            local_host: config.local_host_id,
            hosts,
            drivers,
            aliases,
            env: config.env.into_iter().collect(),
            work_dir,
        })
    }

    pub fn local_host(&self) -> &str {
        &self.local_host
    }

    pub fn is_local_host(&self, id: &str) -> bool {
        self.local_host == id
    }

    pub fn host(&self, id: &str) -> Option<&HostEntry> {
        self.hosts.get(id)
    }

    /// Remote hosts, ordered by id
    pub fn hosts(&self) -> impl Iterator<Item = &HostEntry> {
        self.hosts.values()
    }

    pub fn has_driver(&self, id: &str) -> bool {
        self.drivers.contains(id)
    }

    pub fn drivers(&self) -> impl Iterator<Item = &str> {
        self.drivers.iter().map(String::as_str)
    }

    /// Target of an alias, looked up by its full path (`/alias/...`).
    pub fn alias(&self, path: &str) -> Option<&str> {
        self.aliases.get(path).map(String::as_str)
    }

    pub fn aliases(&self) -> impl Iterator<Item = (&str, &str)> {
        self.aliases.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Longest alias key that is a segment prefix of `path`.
    pub(crate) fn longest_alias<'p>(&self, path: &'p str) -> Option<(&'p str, &str)> {
        let mut candidate = path.trim_end_matches('/');
        while candidate.len() > ALIAS_ROOT.len() {
            if let Some(target) = self.aliases.get(candidate) {
                return Some((candidate, target.as_str()));
            }
            candidate = &candidate[..candidate.rfind('/')?];
        }
        None
    }

    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(String::as_str)
    }

    pub fn work_dir(&self) -> &str {
        &self.work_dir
    }

    pub fn roots(&self) -> &'static [&'static str] {
        &ROOTS
    }
}
