use std::{
    collections::{BTreeSet, HashMap},
    fmt::Write,
    sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError},
    time::{Duration, Instant},
};

use log::{debug, info, trace, warn};

use crate::{
    config::NetConfig,
    directory::Directory,
    error::{CoreError, ValueError},
    path::{
        has_wildcards, is_plain_segment, match_single, split_pattern, wildcards_placed_well,
        PathDomain, PathInfo,
    },
    protocol::WireMessage,
    request::{Request, RequestSet},
    time::Timestamp,
    value::{RcType, ValueState},
};

/// Stable handle of a resource. Resources are never removed, so a key stays
/// valid for the lifetime of the core.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey(u32);

impl ResourceKey {
    fn index(&self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberKey(u64);

impl SubscriberKey {
    pub fn to_u64(&self) -> u64 {
        self.0
    }
}

/// Value/state change of a resource, as delivered to a subscriber
#[derive(Clone, Debug, PartialEq)]
pub struct ResourceEvent {
    pub resource: ResourceKey,
    pub uri: String,
    pub lid: String,
    pub value_state: ValueState,
}

/// Receives events for one subscriber.
///
/// Called from whatever thread caused the change, never while the core
/// holds a lock, so an implementation may call back into the core.
pub trait EventSink: Send + Sync {
    fn on_event(&self, subscriber: SubscriberKey, event: ResourceEvent);
}

impl<F> EventSink for F
where
    F: Fn(SubscriberKey, ResourceEvent) + Send + Sync,
{
    fn on_event(&self, subscriber: SubscriberKey, event: ResourceEvent) {
        self(subscriber, event)
    }
}

impl EventSink for tokio::sync::mpsc::UnboundedSender<(SubscriberKey, ResourceEvent)> {
    fn on_event(&self, subscriber: SubscriberKey, event: ResourceEvent) {
        if self.send((subscriber, event)).is_err() {
            trace!("Dropping event for subscriber {}: receiver is gone", subscriber.0);
        }
    }
}

/// Lets a driver act on requests for its resources.
pub trait DriveHandler: Send + Sync {
    /// `request` is the request that now wins, `None` once no request is
    /// left.
    fn drive(&self, resource: ResourceKey, request: Option<&Request>);
}

impl<F> DriveHandler for F
where
    F: Fn(ResourceKey, Option<&Request>) + Send + Sync,
{
    fn drive(&self, resource: ResourceKey, request: Option<&Request>) {
        self(resource, request)
    }
}

/// Outbound path from the core to remote hosts, implemented by the
/// network engine.
pub trait RemoteGateway: Send + Sync {
    /// Queues a message for `host`. Never blocks.
    fn send(&self, host: &str, message: WireMessage);

    /// Blocks until the resource list of `host` is known, at most for
    /// `timeout`. Returns whether it is known.
    fn await_resources(&self, host: &str, timeout: Duration) -> bool;

    /// A value with a maximum age was stored; the next expiry may now be
    /// earlier than before.
    fn wake(&self) {}
}

struct NullGateway;

impl RemoteGateway for NullGateway {
    fn send(&self, host: &str, message: WireMessage) {
        debug!("No network attached, dropping message for '{}': {}", host, message);
    }

    fn await_resources(&self, _host: &str, _timeout: Duration) -> bool {
        false
    }
}

static NULL_GATEWAY: NullGateway = NullGateway;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubscriberKind {
    Local,
    /// Proxy of a subscriber on a connected peer
    Agent { peer: String },
}

/// Outcome of `ResourceCore::select_resources`
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Selection {
    /// Registered resources matching the pattern
    pub resources: Vec<ResourceKey>,
    /// Resolved expressions to keep matching against future registrations
    pub watch: Vec<String>,
    /// False if some expression had to be skipped
    pub complete: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Location {
    Local { driver: String },
    Remote { host: String },
}

struct SubscriberLink {
    subscriber: SubscriberKey,
    connected: bool,
}

struct ResourceEntry {
    uri: String,
    lid: String,
    location: Location,
    rc_type: RcType,
    value_state: ValueState,
    links: Vec<SubscriberLink>,
    requests: RequestSet,
    driven: Option<Request>,
    max_age: Option<Duration>,
    /// When the current value turns unknown
    expires: Option<Instant>,
}

impl ResourceEntry {
    /// Restarts the expiry clock for a newly stored value. Returns whether
    /// the value will expire.
    fn stamp(&mut self, known: bool, now: Instant) -> bool {
        self.expires = match self.max_age {
            Some(age) if known => Some(now + age),
            _ => None,
        };
        self.expires.is_some()
    }

    fn expired(&self, now: Instant) -> bool {
        self.expires.is_some_and(|t| t <= now)
    }

    fn event(&self, key: ResourceKey) -> ResourceEvent {
        ResourceEvent {
            resource: key,
            uri: self.uri.clone(),
            lid: self.lid.clone(),
            value_state: self.value_state.clone(),
        }
    }

    fn connected_subscribers(&self) -> impl Iterator<Item = SubscriberKey> + '_ {
        self.links
            .iter()
            .filter(|link| link.connected)
            .map(|link| link.subscriber)
    }

    fn remote_host(&self) -> Option<&str> {
        match &self.location {
            Location::Remote { host } => Some(host),
            Location::Local { .. } => None,
        }
    }
}

#[derive(Default)]
struct ResourceTable {
    entries: Vec<ResourceEntry>,
    by_uri: HashMap<String, ResourceKey>,
}

impl ResourceTable {
    fn get(&self, key: ResourceKey) -> Result<&ResourceEntry, CoreError> {
        self.entries.get(key.index()).ok_or_else(|| unknown_key(key))
    }

    fn get_mut(&mut self, key: ResourceKey) -> Result<&mut ResourceEntry, CoreError> {
        self.entries.get_mut(key.index()).ok_or_else(|| unknown_key(key))
    }
}

fn unknown_key(key: ResourceKey) -> CoreError {
    CoreError::UnknownResource {
        uri: format!("#{}", key.0),
    }
}

struct SubscriberEntry {
    gid: String,
    kind: SubscriberKind,
    sink: Arc<dyn EventSink>,
    watch: BTreeSet<String>,
    resources: BTreeSet<ResourceKey>,
}

#[derive(Default)]
struct SubscriberTable {
    entries: HashMap<SubscriberKey, SubscriberEntry>,
    /// Local subscribers only; agents may share an id across connections
    by_gid: HashMap<String, SubscriberKey>,
    next_key: u64,
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Resource and subscriber tables with event fan-out.
///
/// Both tables sit behind their own mutex. Locks are held only while
/// reading or updating the tables; sinks, drive handlers and the remote
/// gateway are always called after the locks are released. Where both are
/// needed, the subscriber table is locked first.
pub struct ResourceCore {
    directory: Arc<Directory>,
    net_timeout: Duration,
    subscribers: Mutex<SubscriberTable>,
    resources: Mutex<ResourceTable>,
    drivers: Mutex<HashMap<String, Arc<dyn DriveHandler>>>,
    gateway: OnceLock<Arc<dyn RemoteGateway>>,
}

impl ResourceCore {
    pub fn new(directory: Arc<Directory>, config: &NetConfig) -> Self {
        Self {
            directory,
            net_timeout: config.net_timeout,
            subscribers: Mutex::new(SubscriberTable::default()),
            resources: Mutex::new(ResourceTable::default()),
            drivers: Mutex::new(HashMap::new()),
            gateway: OnceLock::new(),
        }
    }

    pub fn directory(&self) -> &Arc<Directory> {
        &self.directory
    }

    pub fn local_host(&self) -> &str {
        self.directory.local_host()
    }

    /// Connects the core to the network. Only the first call has an effect.
    pub fn attach_gateway(&self, gateway: Arc<dyn RemoteGateway>) -> bool {
        self.gateway.set(gateway).is_ok()
    }

    fn gateway(&self) -> &dyn RemoteGateway {
        match self.gateway.get() {
            Some(gateway) => gateway.as_ref(),
            None => &NULL_GATEWAY,
        }
    }

    pub fn attach_driver(&self, driver: &str, handler: Arc<dyn DriveHandler>) -> Result<(), CoreError> {
        if !self.directory.has_driver(driver) {
            return Err(CoreError::UnknownDriver {
                driver: driver.to_string(),
            });
        }
        lock(&self.drivers).insert(driver.to_string(), handler);
        Ok(())
    }

    // Registration

    /// Registers a resource of a local driver as `/host/<local>/<driver>/<name>`.
    pub fn register_resource(
        &self,
        driver: &str,
        name: &str,
        rc_type: RcType,
    ) -> Result<ResourceKey, CoreError> {
        if !self.directory.has_driver(driver) {
            return Err(CoreError::UnknownDriver {
                driver: driver.to_string(),
            });
        }
        if !is_plain_path(name) {
            return Err(CoreError::InvalidName {
                name: name.to_string(),
            });
        }
        let lid = format!("{}/{}", driver, name);
        let location = Location::Local {
            driver: driver.to_string(),
        };
        self.register(lid, location, rc_type)
    }

    /// Registers (or updates) the mirror of a resource announced by `host`.
    pub fn register_remote(&self, host: &str, lid: &str, rc_type: RcType) -> Result<ResourceKey, CoreError> {
        if self.directory.host(host).is_none() {
            return Err(CoreError::UnknownHost {
                host: host.to_string(),
            });
        }
        if !is_plain_path(lid) || !lid.contains('/') {
            return Err(CoreError::InvalidName {
                name: lid.to_string(),
            });
        }
        let location = Location::Remote {
            host: host.to_string(),
        };
        self.register(lid.to_string(), location, rc_type)
    }

    fn register(&self, lid: String, location: Location, rc_type: RcType) -> Result<ResourceKey, CoreError> {
        let owner = match &location {
            Location::Local { .. } => self.directory.local_host(),
            Location::Remote { host } => host.as_str(),
        };
        let uri = format!("/host/{}/{}", owner, lid);

        let (key, added) = {
            let mut subscribers = lock(&self.subscribers);
            let mut resources = lock(&self.resources);

            if let Some(&key) = resources.by_uri.get(&uri) {
                let entry = resources.get_mut(key)?;
                if let Location::Local { .. } = location {
                    return Err(CoreError::DuplicateResource { uri });
                }
                if entry.rc_type != rc_type {
                    debug!("Resource '{}' changed its type to {}", uri, rc_type);
                    entry.rc_type = rc_type;
                    entry.value_state = ValueState::unknown(rc_type);
                    entry.expires = None;
                }
                return Ok(key);
            }

            let key = ResourceKey(resources.entries.len() as u32);
            let mut entry = ResourceEntry {
                uri: uri.clone(),
                lid,
                location,
                rc_type,
                value_state: ValueState::unknown(rc_type),
                links: Vec::new(),
                requests: RequestSet::default(),
                driven: None,
                max_age: None,
                expires: None,
            };

            // Watch patterns waiting for this resource
            let mut added = Vec::new();
            for (subscriber_key, subscriber) in subscribers.entries.iter_mut() {
                let wanted = subscriber
                    .watch
                    .iter()
                    .any(|pattern| match_single(&uri, pattern));
                if wanted && subscriber.resources.insert(key) {
                    entry.links.push(SubscriberLink {
                        subscriber: *subscriber_key,
                        connected: false,
                    });
                    added.push((*subscriber_key, key));
                }
            }

            resources.entries.push(entry);
            resources.by_uri.insert(uri.clone(), key);
            (key, added)
        };

        trace!("Registered resource '{}' ({} watchers)", uri, added.len());
        self.connect_links(added);
        Ok(key)
    }

    // Lookup

    fn lookup(&self, uri: &str) -> Option<ResourceKey> {
        lock(&self.resources).by_uri.get(uri).copied()
    }

    /// Classifies `uri` (see `Directory::classify`) and looks up the
    /// resource it names.
    ///
    /// With `allow_wait`, an unknown resource of a remote host may block up
    /// to the network timeout while that host's resource list is fetched.
    /// Without it, this never blocks.
    pub fn analyse<'a>(&self, uri: &'a str, allow_wait: bool) -> PathInfo<'a> {
        let mut info = self.directory.classify(uri);
        if info.domain != PathDomain::Resource {
            return info;
        }
        let Some(lid) = info.lid() else {
            return info;
        };
        let owner = info.host.unwrap_or(self.directory.local_host());
        let canonical = format!("/host/{}/{}", owner, lid);
        info.resource = self.lookup(&canonical);
        if info.resource.is_none() && allow_wait {
            if let Some(host) = info.host {
                if self.gateway().await_resources(host, self.net_timeout) {
                    info.resource = self.lookup(&canonical);
                }
            }
        }
        info
    }

    /// Resolves aliases in `uri` and returns the resource it names.
    pub fn get_resource(&self, uri: &str, allow_wait: bool) -> Option<ResourceKey> {
        let resolution = self.directory.resolve(uri, None);
        if !resolution.resolved {
            return None;
        }
        self.analyse(&resolution.path, allow_wait).resource
    }

    /// Expands a pattern into registered resources and expressions to watch.
    ///
    /// Expressions that cannot be used (unknown alias, host or driver,
    /// wildcards above the driver level) are skipped with a warning and
    /// clear `complete`.
    pub fn select_resources(&self, pattern: &str, allow_wait: bool) -> Selection {
        let mut selection = Selection {
            complete: true,
            ..Selection::default()
        };
        for expr in split_pattern(pattern) {
            match self.select_expression(expr, allow_wait, &mut selection) {
                Ok(()) => {}
                Err(reason) => {
                    warn!("Skipping resource expression '{}': {}", expr, reason);
                    selection.complete = false;
                }
            }
        }
        selection.resources.sort();
        selection.resources.dedup();
        selection
    }

    fn select_expression(
        &self,
        expr: &str,
        allow_wait: bool,
        selection: &mut Selection,
    ) -> Result<(), &'static str> {
        let resolution = self.directory.resolve(expr, None);
        if !resolution.resolved {
            return Err("cannot be resolved");
        }
        let path = resolution.path.as_ref();
        if !wildcards_placed_well(path) {
            return Err("wildcards are only allowed below the driver level");
        }
        let (Some(host), Some(lid)) = (resolution.host(), resolution.lid()) else {
            return Err("does not denote a resource");
        };
        if lid.is_empty() || path.ends_with('/') {
            return Err("does not denote a resource");
        }
        let remote = !self.directory.is_local_host(host);
        if remote {
            if self.directory.host(host).is_none() {
                return Err("unknown host");
            }
        } else {
            let driver = lid.split('/').next().unwrap_or_default();
            if !self.directory.has_driver(driver) {
                return Err("unknown driver");
            }
        }

        if has_wildcards(path) {
            if remote && allow_wait {
                self.gateway().await_resources(host, self.net_timeout);
            }
            let resources = lock(&self.resources);
            selection.resources.extend(
                resources
                    .entries
                    .iter()
                    .enumerate()
                    .filter(|(_, entry)| match_single(&entry.uri, path))
                    .map(|(index, _)| ResourceKey(index as u32)),
            );
            selection.watch.push(path.to_string());
            return Ok(());
        }

        let mut found = self.lookup(path);
        if found.is_none() && remote && allow_wait && self.gateway().await_resources(host, self.net_timeout) {
            found = self.lookup(path);
        }
        match found {
            Some(key) => selection.resources.push(key),
            None => selection.watch.push(path.to_string()),
        }
        Ok(())
    }

    pub fn resource_uri(&self, resource: ResourceKey) -> Option<String> {
        lock(&self.resources).get(resource).ok().map(|e| e.uri.clone())
    }

    pub fn resource_type(&self, resource: ResourceKey) -> Option<RcType> {
        lock(&self.resources).get(resource).ok().map(|e| e.rc_type)
    }

    /// Current value/state; an expired value reads as unknown even before
    /// `expire_values` has run.
    pub fn value_state(&self, resource: ResourceKey) -> Option<ValueState> {
        let resources = lock(&self.resources);
        let entry = resources.get(resource).ok()?;
        if entry.expired(Instant::now()) {
            Some(entry.value_state.to_unknown())
        } else {
            Some(entry.value_state.clone())
        }
    }

    /// LIDs and types of all local resources, in registration order
    pub fn local_resources(&self) -> Vec<(String, RcType)> {
        lock(&self.resources)
            .entries
            .iter()
            .filter(|e| matches!(e.location, Location::Local { .. }))
            .map(|e| (e.lid.clone(), e.rc_type))
            .collect()
    }

    /// LIDs of the mirrors of `host`
    pub fn remote_resources(&self, host: &str) -> Vec<String> {
        lock(&self.resources)
            .entries
            .iter()
            .filter(|e| e.remote_host() == Some(host))
            .map(|e| e.lid.clone())
            .collect()
    }

    // Values

    /// Stores a new value/state; connected subscribers are notified only if
    /// it differs from the previous one.
    pub fn report_value(&self, resource: ResourceKey, value_state: ValueState) -> Result<(), CoreError> {
        let (events, expiring) = {
            let mut resources = lock(&self.resources);
            let entry = resources.get_mut(resource)?;
            let value_state = if value_state.is_known() {
                if value_state.rc_type() != entry.rc_type {
                    return Err(CoreError::TypeMismatch {
                        uri: entry.uri.clone(),
                        expected: entry.rc_type,
                        found: value_state.rc_type(),
                    });
                }
                value_state
            } else {
                ValueState::unknown(entry.rc_type)
            };
            let expiring = entry.stamp(value_state.is_known(), Instant::now());
            if entry.value_state == value_state {
                (Vec::new(), expiring)
            } else {
                entry.value_state = value_state;
                let event = entry.event(resource);
                let events = entry
                    .connected_subscribers()
                    .map(|subscriber| (subscriber, event.clone()))
                    .collect::<Vec<_>>();
                (events, expiring)
            }
        };
        if expiring {
            self.gateway().wake();
        }
        self.dispatch(events);
        Ok(())
    }

    /// Lets values of `resource` turn unknown once they are older than
    /// `max_age`. `None` keeps them forever. A value already stored counts
    /// as fresh unless it has expired under the previous age.
    pub fn set_max_age(&self, resource: ResourceKey, max_age: Option<Duration>) -> Result<(), CoreError> {
        let now = Instant::now();
        let (events, expiring) = {
            let mut resources = lock(&self.resources);
            let entry = resources.get_mut(resource)?;
            let mut events = Vec::new();
            // Already too old under the previous age
            if entry.expired(now) {
                entry.value_state = entry.value_state.to_unknown();
                let event = entry.event(resource);
                events.extend(entry.connected_subscribers().map(|s| (s, event.clone())));
            }
            entry.max_age = max_age;
            let known = entry.value_state.is_known();
            (events, entry.stamp(known, now))
        };
        if expiring {
            self.gateway().wake();
        }
        self.dispatch(events);
        Ok(())
    }

    /// Marks every value older than its resource's maximum age unknown and
    /// notifies the subscribers. Returns the number of expired values.
    pub fn expire_values(&self, now: Instant) -> usize {
        let (expired, events) = {
            let mut resources = lock(&self.resources);
            let mut expired = 0;
            let mut events = Vec::new();
            for (index, entry) in resources.entries.iter_mut().enumerate() {
                if !entry.expired(now) {
                    continue;
                }
                expired += 1;
                entry.expires = None;
                entry.value_state = entry.value_state.to_unknown();
                let event = entry.event(ResourceKey(index as u32));
                events.extend(entry.connected_subscribers().map(|s| (s, event.clone())));
            }
            (expired, events)
        };
        if expired > 0 {
            debug!("{} values expired", expired);
        }
        self.dispatch(events);
        expired
    }

    /// When the next value expires
    pub fn next_expiry(&self) -> Option<Instant> {
        lock(&self.resources)
            .entries
            .iter()
            .filter_map(|e| e.expires)
            .min()
    }

    fn dispatch(&self, events: Vec<(SubscriberKey, ResourceEvent)>) {
        if events.is_empty() {
            return;
        }
        let deliveries: Vec<_> = {
            let subscribers = lock(&self.subscribers);
            events
                .into_iter()
                .filter_map(|(key, event)| {
                    subscribers
                        .entries
                        .get(&key)
                        .map(|entry| (entry.sink.clone(), key, event))
                })
                .collect()
        };
        for (sink, key, event) in deliveries {
            sink.on_event(key, event);
        }
    }

    // Subscribers

    /// Creates a local subscriber with the global id `<local-host>/<name>`.
    pub fn new_subscriber(&self, name: &str, sink: Arc<dyn EventSink>) -> Result<SubscriberKey, CoreError> {
        if !is_plain_segment(name) {
            return Err(CoreError::InvalidName {
                name: name.to_string(),
            });
        }
        let gid = format!("{}/{}", self.directory.local_host(), name);
        let mut subscribers = lock(&self.subscribers);
        if subscribers.by_gid.contains_key(&gid) {
            return Err(CoreError::DuplicateSubscriber { gid });
        }
        let key = insert_subscriber(&mut subscribers, gid.clone(), SubscriberKind::Local, sink);
        subscribers.by_gid.insert(gid, key);
        Ok(key)
    }

    /// Creates a subscriber standing in for `gid` on the peer `peer`.
    pub fn new_agent(&self, gid: &str, peer: &str, sink: Arc<dyn EventSink>) -> Result<SubscriberKey, CoreError> {
        if !is_plain_path(gid) {
            return Err(CoreError::InvalidName {
                name: gid.to_string(),
            });
        }
        let kind = SubscriberKind::Agent {
            peer: peer.to_string(),
        };
        Ok(insert_subscriber(&mut lock(&self.subscribers), gid.to_string(), kind, sink))
    }

    /// Removes a subscriber together with all its links and watch patterns.
    pub fn drop_subscriber(&self, subscriber: SubscriberKey) -> Result<(), CoreError> {
        let outbound = {
            let mut subscribers = lock(&self.subscribers);
            let mut resources = lock(&self.resources);
            let entry = subscribers
                .entries
                .remove(&subscriber)
                .ok_or(CoreError::UnknownSubscriber { key: subscriber.0 })?;
            if subscribers.by_gid.get(&entry.gid) == Some(&subscriber) {
                subscribers.by_gid.remove(&entry.gid);
            }
            unlink(&mut resources, subscriber, &entry.gid, entry.resources.iter().copied())
        };
        self.send_all(outbound);
        Ok(())
    }

    pub fn subscriber_gid(&self, subscriber: SubscriberKey) -> Option<String> {
        lock(&self.subscribers)
            .entries
            .get(&subscriber)
            .map(|e| e.gid.clone())
    }

    /// Subscribes to all resources matching `pattern`, now and in future.
    ///
    /// Subscribing twice to the same resource has no further effect.
    /// Returns whether every expression of the pattern could be processed.
    pub fn subscribe(&self, subscriber: SubscriberKey, pattern: &str, allow_wait: bool) -> Result<bool, CoreError> {
        let selection = self.select_resources(pattern, allow_wait);
        let added = {
            let mut subscribers = lock(&self.subscribers);
            let mut resources = lock(&self.resources);
            let entry = subscribers
                .entries
                .get_mut(&subscriber)
                .ok_or(CoreError::UnknownSubscriber { key: subscriber.0 })?;
            entry.watch.extend(selection.watch.iter().cloned());

            // Resources registered since the selection was made
            let mut candidates = selection.resources.clone();
            if !selection.watch.is_empty() {
                candidates.extend(
                    resources
                        .entries
                        .iter()
                        .enumerate()
                        .filter(|(_, resource)| {
                            selection
                                .watch
                                .iter()
                                .any(|pattern| match_single(&resource.uri, pattern))
                        })
                        .map(|(index, _)| ResourceKey(index as u32)),
                );
            }

            let mut added = Vec::new();
            for key in candidates {
                if entry.resources.insert(key) {
                    resources.get_mut(key)?.links.push(SubscriberLink {
                        subscriber,
                        connected: false,
                    });
                    added.push((subscriber, key));
                }
            }
            added
        };
        self.connect_links(added);
        Ok(selection.complete)
    }

    /// Wires up freshly created links: peers are told about remote
    /// subscriptions, then the links start delivering and local resources
    /// send their current value.
    fn connect_links(&self, added: Vec<(SubscriberKey, ResourceKey)>) {
        if added.is_empty() {
            return;
        }

        let outbound: Vec<_> = {
            let subscribers = lock(&self.subscribers);
            let resources = lock(&self.resources);
            added
                .iter()
                .filter_map(|(subscriber, resource)| {
                    let gid = &subscribers.entries.get(subscriber)?.gid;
                    let entry = resources.get(*resource).ok()?;
                    let host = entry.remote_host()?;
                    let message = WireMessage::Subscribe {
                        subscriber: gid.clone(),
                        lid: entry.lid.clone(),
                    };
                    Some((host.to_string(), message))
                })
                .collect()
        };
        self.send_all(outbound);

        let initial: Vec<_> = {
            let subscribers = lock(&self.subscribers);
            let mut resources = lock(&self.resources);
            let now = Instant::now();
            let mut initial = Vec::new();
            for (subscriber, resource) in added {
                let Ok(entry) = resources.get_mut(resource) else {
                    continue;
                };
                let Some(link) = entry.links.iter_mut().find(|l| l.subscriber == subscriber) else {
                    continue;
                };
                link.connected = true;
                // Remote hosts send the current value themselves
                if entry.remote_host().is_some() || !entry.value_state.is_known() || entry.expired(now) {
                    continue;
                }
                if let Some(sub) = subscribers.entries.get(&subscriber) {
                    initial.push((sub.sink.clone(), subscriber, entry.event(resource)));
                }
            }
            initial
        };
        for (sink, key, event) in initial {
            sink.on_event(key, event);
        }
    }

    /// Removes the links and watch patterns selected by `pattern`.
    pub fn unsubscribe(&self, subscriber: SubscriberKey, pattern: &str) -> Result<(), CoreError> {
        let paths: Vec<String> = split_pattern(pattern)
            .map(|expr| self.directory.resolve(expr, None))
            .filter(|resolution| resolution.resolved)
            .map(|resolution| resolution.path.into_owned())
            .collect();

        let outbound = {
            let mut subscribers = lock(&self.subscribers);
            let mut resources = lock(&self.resources);
            let entry = subscribers
                .entries
                .get_mut(&subscriber)
                .ok_or(CoreError::UnknownSubscriber { key: subscriber.0 })?;
            entry.watch.retain(|pattern| !paths.contains(pattern));
            let removed: Vec<ResourceKey> = entry
                .resources
                .iter()
                .copied()
                .filter(|key| {
                    resources
                        .get(*key)
                        .map(|e| paths.iter().any(|p| match_single(&e.uri, p)))
                        .unwrap_or(false)
                })
                .collect();
            for key in &removed {
                entry.resources.remove(key);
            }
            unlink(&mut resources, subscriber, &entry.gid, removed.into_iter())
        };
        self.send_all(outbound);
        Ok(())
    }

    /// Resources the subscriber is linked to
    pub fn subscriber_resources(&self, subscriber: SubscriberKey) -> Vec<ResourceKey> {
        lock(&self.subscribers)
            .entries
            .get(&subscriber)
            .map(|e| e.resources.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Watch patterns of the subscriber
    pub fn watch_patterns(&self, subscriber: SubscriberKey) -> Vec<String> {
        lock(&self.subscribers)
            .entries
            .get(&subscriber)
            .map(|e| e.watch.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of subscriber links on a resource
    pub fn link_count(&self, resource: ResourceKey) -> usize {
        lock(&self.resources)
            .get(resource)
            .map(|e| e.links.len())
            .unwrap_or(0)
    }

    // Requests

    /// Adds or replaces a request. Ids without a host part are qualified
    /// with the local host id.
    ///
    /// Local resources pass the winning request to their driver's
    /// `DriveHandler` whenever it changes. For remote resources the request
    /// is forwarded and kept so it can be re-sent after a reconnect.
    pub fn set_request(&self, resource: ResourceKey, mut request: Request) -> Result<(), CoreError> {
        if request.id().is_empty() || request.id().contains(char::is_whitespace) {
            return Err(CoreError::InvalidName {
                name: request.id().to_string(),
            });
        }
        request.qualify(self.directory.local_host());
        let now = Timestamp::now_or_epoch();

        let (drive, outbound) = {
            let mut resources = lock(&self.resources);
            let entry = resources.get_mut(resource)?;
            if request.value().rc_type() != entry.rc_type {
                return Err(CoreError::TypeMismatch {
                    uri: entry.uri.clone(),
                    expected: entry.rc_type,
                    found: request.value().rc_type(),
                });
            }
            entry.requests.prune(now);
            match entry.location.clone() {
                Location::Local { driver } => {
                    entry.requests.set(request);
                    (self.reevaluate(entry, now).map(|w| (driver, w)), None)
                }
                Location::Remote { host } => {
                    let message = WireMessage::SetRequest {
                        lid: entry.lid.clone(),
                        id: request.id().to_string(),
                        priority: request.priority(),
                        t1: request.t1(),
                        value: ValueState::valid(request.value().clone()).encode(),
                    };
                    entry.requests.set(request);
                    (None, Some((host, message)))
                }
            }
        };

        if let Some((driver, winner)) = drive {
            self.drive(&driver, resource, winner.as_ref());
        }
        self.send_all(outbound.into_iter().collect());
        Ok(())
    }

    /// Removes a request. With a `t1` in the future, the request stays
    /// active until then.
    pub fn del_request(&self, resource: ResourceKey, id: &str, t1: Option<Timestamp>) -> Result<(), CoreError> {
        let id = if id.contains('/') {
            id.to_string()
        } else {
            format!("{}/{}", self.directory.local_host(), id)
        };
        let now = Timestamp::now_or_epoch();

        let (drive, outbound) = {
            let mut resources = lock(&self.resources);
            let entry = resources.get_mut(resource)?;
            let delayed = t1.filter(|t1| *t1 > now);
            match delayed {
                Some(t1) => {
                    let existing = entry.requests.iter().find(|r| r.id() == id).cloned();
                    if let Some(existing) = existing {
                        entry.requests.set(existing.with_expiry(t1));
                    }
                }
                None => {
                    entry.requests.remove(&id);
                }
            }
            entry.requests.prune(now);
            match entry.location.clone() {
                Location::Local { driver } => (self.reevaluate(entry, now).map(|w| (driver, w)), None),
                Location::Remote { host } => {
                    let message = WireMessage::DelRequest {
                        lid: entry.lid.clone(),
                        id: id.clone(),
                        t1,
                    };
                    (None, Some((host, message)))
                }
            }
        };

        if let Some((driver, winner)) = drive {
            self.drive(&driver, resource, winner.as_ref());
        }
        self.send_all(outbound.into_iter().collect());
        Ok(())
    }

    /// The request currently winning on a resource
    pub fn active_request(&self, resource: ResourceKey) -> Option<Request> {
        let now = Timestamp::now_or_epoch();
        lock(&self.resources)
            .get(resource)
            .ok()
            .and_then(|e| e.requests.winner(now).cloned())
    }

    /// `Some(winner)` if the winning request differs from the one the
    /// driver last saw.
    fn reevaluate(&self, entry: &mut ResourceEntry, now: Timestamp) -> Option<Option<Request>> {
        let winner = entry.requests.winner(now).cloned();
        if winner == entry.driven {
            return None;
        }
        entry.driven = winner.clone();
        Some(winner)
    }

    fn drive(&self, driver: &str, resource: ResourceKey, request: Option<&Request>) {
        let handler = lock(&self.drivers).get(driver).cloned();
        match handler {
            Some(handler) => handler.drive(resource, request),
            None => debug!("Driver '{}' has no drive handler attached", driver),
        }
    }

    // Remote hosts

    /// Applies a `value` line from `host` to the mirror of `lid` and hands
    /// it to the addressed local subscriber.
    ///
    /// Returns `Ok(false)` if the mirror or the subscriber no longer exists.
    pub fn deliver_remote(&self, host: &str, subscriber: &str, lid: &str, value: &str) -> Result<bool, ValueError> {
        let uri = format!("/host/{}/{}", host, lid);
        let delivery = {
            let subscribers = lock(&self.subscribers);
            let mut resources = lock(&self.resources);
            let Some(&resource) = resources.by_uri.get(&uri) else {
                debug!("Event for unknown resource '{}'", uri);
                return Ok(false);
            };
            let Ok(entry) = resources.get_mut(resource) else {
                return Ok(false);
            };
            entry.value_state = ValueState::decode(entry.rc_type, value)?;
            let known = entry.value_state.is_known();
            entry.stamp(known, Instant::now());
            let target = subscribers
                .by_gid
                .get(subscriber)
                .filter(|key| entry.connected_subscribers().any(|s| s == **key))
                .and_then(|key| subscribers.entries.get(key).map(|e| (*key, e.sink.clone())));
            match target {
                Some((key, sink)) => (sink, key, entry.event(resource)),
                None => {
                    debug!("Event for '{}' addressed to unlinked subscriber '{}'", uri, subscriber);
                    return Ok(false);
                }
            }
        };
        let (sink, key, event) = delivery;
        sink.on_event(key, event);
        Ok(true)
    }

    /// Marks all mirrors of `host` unknown after contact was lost. The
    /// mirrors themselves stay.
    pub fn invalidate_host(&self, host: &str) {
        let events = {
            let mut resources = lock(&self.resources);
            let mut events = Vec::new();
            for (index, entry) in resources.entries.iter_mut().enumerate() {
                if entry.remote_host() != Some(host) || !entry.value_state.is_known() {
                    continue;
                }
                entry.value_state = entry.value_state.to_unknown();
                entry.expires = None;
                let event = entry.event(ResourceKey(index as u32));
                events.extend(entry.connected_subscribers().map(|s| (s, event.clone())));
            }
            events
        };
        if !events.is_empty() {
            info!("Lost contact to '{}', {} notifications", host, events.len());
        }
        self.dispatch(events);
    }

    /// Whether anything local still needs a connection to `host`
    pub fn has_remote_demand(&self, host: &str) -> bool {
        lock(&self.resources)
            .entries
            .iter()
            .filter(|e| e.remote_host() == Some(host))
            .any(|e| !e.links.is_empty() || !e.requests.is_empty())
    }

    /// Subscriptions and requests to re-send after (re)connecting to `host`
    pub fn remote_resync(&self, host: &str) -> Vec<WireMessage> {
        let subscribers = lock(&self.subscribers);
        let resources = lock(&self.resources);
        let now = Timestamp::now_or_epoch();
        let mut messages = Vec::new();
        for entry in resources.entries.iter().filter(|e| e.remote_host() == Some(host)) {
            for link in &entry.links {
                if let Some(subscriber) = subscribers.entries.get(&link.subscriber) {
                    messages.push(WireMessage::Subscribe {
                        subscriber: subscriber.gid.clone(),
                        lid: entry.lid.clone(),
                    });
                }
            }
            for request in entry.requests.iter().filter(|r| !r.is_expired(now)) {
                messages.push(WireMessage::SetRequest {
                    lid: entry.lid.clone(),
                    id: request.id().to_string(),
                    priority: request.priority(),
                    t1: request.t1(),
                    value: ValueState::valid(request.value().clone()).encode(),
                });
            }
        }
        messages
    }

    fn send_all(&self, outbound: Vec<(String, WireMessage)>) {
        let gateway = self.gateway();
        for (host, message) in outbound {
            gateway.send(&host, message);
        }
    }

    // Info

    /// Human-readable state of a resource. Verbosity 0 gives one line,
    /// 1 adds subscribers and requests, 2 adds link states.
    pub fn resource_info(&self, resource: ResourceKey, verbosity: u8) -> Option<String> {
        let subscribers = lock(&self.subscribers);
        let resources = lock(&self.resources);
        let entry = resources.get(resource).ok()?;
        let mut out = format!("{} {} {}", entry.uri, entry.rc_type, entry.value_state);
        if verbosity >= 1 {
            for link in &entry.links {
                let gid = subscribers
                    .entries
                    .get(&link.subscriber)
                    .map(|s| s.gid.as_str())
                    .unwrap_or("?");
                if verbosity >= 2 {
                    let state = if link.connected { "connected" } else { "connecting" };
                    let _ = write!(out, "\n  subscriber {} ({})", gid, state);
                } else {
                    let _ = write!(out, "\n  subscriber {}", gid);
                }
            }
            for request in entry.requests.iter() {
                let _ = write!(
                    out,
                    "\n  request {} prio={} value={}",
                    request.id(),
                    request.priority(),
                    request.value()
                );
                if let Some(t1) = request.t1() {
                    let _ = write!(out, " t1={}", t1);
                }
            }
        }
        Some(out)
    }

    /// `resource_info` for a local resource given by its LID
    pub fn local_resource_info(&self, lid: &str, verbosity: u8) -> Option<String> {
        let uri = format!("/host/{}/{}", self.directory.local_host(), lid);
        let key = self.lookup(&uri)?;
        self.resource_info(key, verbosity)
    }

    /// One line per subscriber; verbosity 1 adds linked resources, 2 adds
    /// watch patterns.
    pub fn subscribers_info(&self, verbosity: u8) -> String {
        let subscribers = lock(&self.subscribers);
        let resources = lock(&self.resources);
        let mut entries: Vec<_> = subscribers.entries.iter().collect();
        entries.sort_by_key(|(key, _)| **key);

        let mut out = String::new();
        for (_, entry) in entries {
            let kind = match &entry.kind {
                SubscriberKind::Local => "local".to_string(),
                SubscriberKind::Agent { peer } => format!("agent of {}", peer),
            };
            let _ = writeln!(out, "{} ({}, {} resources)", entry.gid, kind, entry.resources.len());
            if verbosity >= 1 {
                for key in &entry.resources {
                    if let Ok(resource) = resources.get(*key) {
                        let _ = writeln!(out, "  {} {}", resource.uri, resource.value_state);
                    }
                }
            }
            if verbosity >= 2 {
                for pattern in &entry.watch {
                    let _ = writeln!(out, "  watch {}", pattern);
                }
            }
        }
        out
    }
}

fn insert_subscriber(
    subscribers: &mut SubscriberTable,
    gid: String,
    kind: SubscriberKind,
    sink: Arc<dyn EventSink>,
) -> SubscriberKey {
    let key = SubscriberKey(subscribers.next_key);
    subscribers.next_key += 1;
    subscribers.entries.insert(
        key,
        SubscriberEntry {
            gid,
            kind,
            sink,
            watch: BTreeSet::new(),
            resources: BTreeSet::new(),
        },
    );
    key
}

/// Removes the links of `subscriber` from `keys`; returns the unsubscribe
/// messages for remote resources.
fn unlink(
    resources: &mut ResourceTable,
    subscriber: SubscriberKey,
    gid: &str,
    keys: impl Iterator<Item = ResourceKey>,
) -> Vec<(String, WireMessage)> {
    let mut outbound = Vec::new();
    for key in keys {
        let Ok(entry) = resources.get_mut(key) else {
            continue;
        };
        entry.links.retain(|link| link.subscriber != subscriber);
        if let Some(host) = entry.remote_host() {
            outbound.push((
                host.to_string(),
                WireMessage::Unsubscribe {
                    subscriber: gid.to_string(),
                    lid: entry.lid.clone(),
                },
            ));
        }
    }
    outbound
}

/// One or more plain segments separated by `/`
fn is_plain_path(s: &str) -> bool {
    !s.is_empty() && s.split('/').all(is_plain_segment)
}
