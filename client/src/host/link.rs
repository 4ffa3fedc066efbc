use std::{
    mem,
    time::{Duration, Instant},
};

use log::{debug, info, warn};

use reslink_shared::{LineBuffer, NetConfig, WireError, WireMessage};

use super::state::{HostAction, HostOpcode, HostState};

/// Connection state machine of one remote host.
///
/// Owned by the network thread. It performs no I/O: every input returns the
/// actions the engine has to carry out, and `next_deadline` tells the
/// engine when to deliver the next `Timer`.
pub struct HostLink {
    id: String,
    state: HostState,
    config: NetConfig,
    send_buffer: String,
    receive_buffer: LineBuffer,
    attempt: u64,
    /// Current backoff; `None` outside a failure streak
    retry_interval: Option<Duration>,
    /// Start of the current failure streak
    first_retry: Option<Instant>,
    t_retry: Option<Instant>,
    t_idle: Option<Instant>,
    t_age: Option<Instant>,
    last_heard: Option<Instant>,
}

impl HostLink {
    /// A host starts in `NewRetryWait` with its first attempt due right
    /// away, so its resource list is fetched at startup.
    pub fn new(id: &str, config: &NetConfig, now: Instant) -> Self {
        Self {
            id: id.to_string(),
            state: HostState::NewRetryWait,
            config: config.clone(),
            send_buffer: String::new(),
            receive_buffer: LineBuffer::new(),
            attempt: 0,
            retry_interval: None,
            first_retry: None,
            t_retry: Some(now),
            t_idle: None,
            t_age: None,
            last_heard: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> HostState {
        self.state
    }

    /// Number of the most recent connect attempt
    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    pub fn retry_interval(&self) -> Option<Duration> {
        self.retry_interval
    }

    pub fn retry_deadline(&self) -> Option<Instant> {
        self.t_retry
    }

    /// Whether queued data waits to be written
    pub fn has_pending(&self) -> bool {
        !self.send_buffer.is_empty()
    }

    /// Earliest point at which `Timer` has something to do
    pub fn next_deadline(&self) -> Option<Instant> {
        match self.state.base() {
            HostState::RetryWait => self.t_retry,
            HostState::Connected => {
                let alive = self.last_heard.map(|t| t + self.config.alive_timeout);
                let idle = if self.state.is_new() { None } else { self.t_idle };
                [alive, idle, self.t_age].into_iter().flatten().min()
            }
            _ => None,
        }
    }

    // Outgoing data

    /// Appends a message to the send buffer. Follow up with `Send`.
    pub fn queue(&mut self, message: &WireMessage) {
        message.write_to(&mut self.send_buffer);
    }

    // Incoming data

    /// Feeds bytes read from the socket; returns every complete line.
    pub fn receive(&mut self, bytes: &[u8], now: Instant) -> Vec<Result<WireMessage, WireError>> {
        self.mark_heard(now);
        self.receive_buffer.extend(bytes);
        self.receive_buffer.drain_messages()
    }

    pub fn mark_heard(&mut self, now: Instant) {
        self.last_heard = Some(now);
    }

    /// The peer finished sending its resource list. Returns true if this
    /// completed the `New` phase.
    pub fn resources_complete(&mut self, now: Instant) -> bool {
        if self.state != HostState::NewConnected {
            return false;
        }
        self.set_state(HostState::Connected);
        self.t_idle = Some(now + self.config.idle_timeout);
        true
    }

    // State machine

    /// Applies one opcode. `demand` tells whether subscriptions, requests
    /// or queries still need this host.
    pub fn handle(&mut self, opcode: HostOpcode, demand: bool, now: Instant) -> Vec<HostAction> {
        match opcode {
            HostOpcode::Send => self.on_send(now),
            HostOpcode::Disconnect => self.disconnect(demand, now),
            HostOpcode::Timer => self.on_timer(demand, now),
            HostOpcode::ConnectSuccess => self.on_connect_success(now),
            HostOpcode::ConnectFailed => self.on_connect_failed(now),
        }
    }

    fn on_send(&mut self, now: Instant) -> Vec<HostAction> {
        match self.state.base() {
            HostState::Standby | HostState::RetryWait => self.start_connect(),
            HostState::Connected => {
                self.t_idle = Some(now + self.config.idle_timeout);
                self.flush()
            }
            _ => Vec::new(),
        }
    }

    fn on_timer(&mut self, demand: bool, now: Instant) -> Vec<HostAction> {
        match self.state.base() {
            HostState::RetryWait => match self.t_retry {
                Some(t_retry) if t_retry <= now => self.start_connect(),
                _ => Vec::new(),
            },
            HostState::Connected => {
                if let Some(heard) = self.last_heard {
                    if now >= heard + self.config.alive_timeout {
                        info!("Host '{}' has been silent for too long, disconnecting", self.id);
                        return self.disconnect(demand, now);
                    }
                }

                let mut actions = Vec::new();
                if self.t_age.is_some_and(|t| t <= now) {
                    debug!("Refreshing resource list of host '{}'", self.id);
                    self.t_age = Some(now + self.config.age_interval);
                    actions.push(HostAction::RefreshResources);
                }
                if !self.state.is_new() && self.t_idle.is_some_and(|t| t <= now) {
                    if demand {
                        self.t_idle = Some(now + self.config.idle_timeout);
                    } else {
                        info!("Connection to host '{}' is idle, closing", self.id);
                        actions.extend(self.disconnect(false, now));
                    }
                }
                actions
            }
            _ => Vec::new(),
        }
    }

    fn on_connect_success(&mut self, now: Instant) -> Vec<HostAction> {
        if !self.state.is_connecting() {
            warn!(
                "Host '{}': connect success reported in state {}, ignoring",
                self.id, self.state
            );
            return Vec::new();
        }
        self.set_state(self.state.with_base(HostState::Connected));
        self.retry_interval = None;
        self.first_retry = None;
        self.t_retry = None;
        self.t_idle = Some(now + self.config.idle_timeout);
        self.t_age = Some(now + self.config.age_interval);
        self.last_heard = Some(now);
        self.receive_buffer.clear();

        let mut actions = vec![HostAction::Greet];
        actions.extend(self.flush());
        actions
    }

    fn on_connect_failed(&mut self, now: Instant) -> Vec<HostAction> {
        if !self.state.is_connecting() {
            warn!(
                "Host '{}': connect failure reported in state {}, ignoring",
                self.id, self.state
            );
            return Vec::new();
        }

        let interval = match self.retry_interval {
            None => self.config.retry_min,
            Some(previous) => (previous * 2).min(self.config.retry_max),
        };
        self.retry_interval = Some(interval);
        let first_retry = *self.first_retry.get_or_insert(now);

        if !self.state.is_new() && now.duration_since(first_retry) >= self.config.retry_give_up {
            info!(
                "Host '{}' unreachable for {:?}, parking in standby",
                self.id,
                now.duration_since(first_retry)
            );
            self.park();
            return Vec::new();
        }

        // Spread reconnects of many hosts a little
        let jitter_ms = fastrand::u64(0..=(interval.as_millis() as u64) / 10);
        self.t_retry = Some(now + interval + Duration::from_millis(jitter_ms));
        self.set_state(self.state.with_base(HostState::RetryWait));
        debug!("Host '{}' retrying in {:?}", self.id, interval);
        Vec::new()
    }

    fn disconnect(&mut self, demand: bool, now: Instant) -> Vec<HostAction> {
        let mut actions = Vec::new();
        match self.state.base() {
            HostState::Connected => {
                actions.push(HostAction::Close);
                actions.push(HostAction::Invalidate);
                self.send_buffer.clear();
                self.receive_buffer.clear();
            }
            HostState::Connecting => {
                actions.push(HostAction::CancelConnect);
                self.send_buffer.clear();
            }
            _ => {}
        }
        self.t_idle = None;
        self.t_age = None;
        self.last_heard = None;

        if demand || self.state.is_new() {
            if self.state.base() != HostState::RetryWait {
                self.t_retry = Some(now + self.config.retry_min);
            }
            self.set_state(self.state.with_base(HostState::RetryWait));
        } else {
            self.park();
        }
        actions
    }

    fn start_connect(&mut self) -> Vec<HostAction> {
        self.attempt += 1;
        self.t_retry = None;
        self.set_state(self.state.with_base(HostState::Connecting));
        vec![HostAction::Connect {
            attempt: self.attempt,
        }]
    }

    fn park(&mut self) {
        self.t_retry = None;
        self.first_retry = None;
        self.retry_interval = None;
        self.send_buffer.clear();
        self.set_state(self.state.with_base(HostState::Standby));
    }

    fn flush(&mut self) -> Vec<HostAction> {
        if self.send_buffer.is_empty() {
            return Vec::new();
        }
        vec![HostAction::Write(mem::take(&mut self.send_buffer))]
    }

    fn set_state(&mut self, state: HostState) {
        if state != self.state {
            debug!("Host '{}': {} -> {}", self.id, self.state, state);
            self.state = state;
        }
    }
}
