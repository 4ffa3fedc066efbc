use std::{
    fmt::Write,
    mem,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering},
        Condvar, Mutex, MutexGuard, PoisonError,
    },
    time::{Duration, Instant},
};

use log::debug;

use reslink_shared::{HostEntry, InfoQuery, Timestamp, WireMessage};

use crate::{error::InfoError, host::state::HostState};

/// What the connector last did, readable from any thread
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectorInfo {
    /// Socket address the last successful attempt connected to
    pub address: Option<SocketAddr>,
    pub last_attempt: Option<Timestamp>,
    pub last_error: Option<String>,
}

enum InfoSlot {
    Idle,
    Waiting { query_id: u64, lines: Vec<String> },
    Done(Result<String, InfoError>),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The thread-safe face of a remote host.
///
/// The state machine itself lives on the network thread; this handle
/// mirrors its state and carries the few fields other threads may read or
/// wait on.
pub struct Host {
    entry: HostEntry,
    state: AtomicU8,
    /// Milliseconds since the epoch, 0 if never heard
    last_alive: AtomicU64,
    write_pending: AtomicBool,
    connector: Mutex<ConnectorInfo>,
    resources_known: Mutex<bool>,
    resources_ready: Condvar,
    info: Mutex<InfoSlot>,
    info_ready: Condvar,
    last_query_id: AtomicU64,
}

impl Host {
    pub fn new(entry: HostEntry) -> Self {
        Self {
            entry,
            state: AtomicU8::new(HostState::NewRetryWait.to_u8()),
            last_alive: AtomicU64::new(0),
            write_pending: AtomicBool::new(false),
            connector: Mutex::new(ConnectorInfo::default()),
            resources_known: Mutex::new(false),
            resources_ready: Condvar::new(),
            info: Mutex::new(InfoSlot::Idle),
            info_ready: Condvar::new(),
            last_query_id: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.entry.id
    }

    pub fn entry(&self) -> &HostEntry {
        &self.entry
    }

    // State mirror

    pub fn state(&self) -> HostState {
        HostState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Called by the network engine after each transition.
    pub fn set_state(&self, state: HostState) {
        self.state.store(state.to_u8(), Ordering::Release);
    }

    pub fn last_alive(&self) -> Option<Timestamp> {
        match self.last_alive.load(Ordering::Relaxed) {
            0 => None,
            millis => Some(Timestamp::from_millis(millis)),
        }
    }

    pub fn mark_alive(&self, now: Timestamp) {
        self.last_alive.store(now.as_millis(), Ordering::Relaxed);
    }

    pub fn write_pending(&self) -> bool {
        self.write_pending.load(Ordering::Relaxed)
    }

    pub fn set_write_pending(&self, pending: bool) {
        self.write_pending.store(pending, Ordering::Relaxed);
    }

    // Connector

    pub fn connector_info(&self) -> ConnectorInfo {
        lock(&self.connector).clone()
    }

    pub(crate) fn record_attempt(&self, now: Timestamp) {
        lock(&self.connector).last_attempt = Some(now);
    }

    pub(crate) fn record_connected(&self, address: SocketAddr) {
        let mut connector = lock(&self.connector);
        connector.address = Some(address);
        connector.last_error = None;
    }

    pub(crate) fn record_error(&self, error: &str) {
        lock(&self.connector).last_error = Some(error.to_string());
    }

    // Resource list

    pub fn resources_known(&self) -> bool {
        *lock(&self.resources_known)
    }

    /// The host's complete resource list has been received once.
    pub fn set_resources_known(&self) {
        *lock(&self.resources_known) = true;
        self.resources_ready.notify_all();
    }

    /// Blocks until the resource list is known, at most for `timeout`.
    pub fn wait_resources(&self, timeout: Duration) -> bool {
        let known = lock(&self.resources_known);
        let (known, _) = self
            .resources_ready
            .wait_timeout_while(known, timeout, |known| !*known)
            .unwrap_or_else(PoisonError::into_inner);
        *known
    }

    // Info queries

    /// Sends `query` through `submit` and blocks until the answer arrives,
    /// the connection is lost or `timeout` passes. Only one query per host
    /// may be in flight; answers to earlier, abandoned queries are dropped.
    pub fn remote_info(
        &self,
        query: InfoQuery,
        timeout: Duration,
        submit: impl FnOnce(WireMessage),
    ) -> Result<String, InfoError> {
        let query_id = {
            let mut slot = lock(&self.info);
            if !matches!(*slot, InfoSlot::Idle) {
                return Err(InfoError::Busy {
                    host: self.id().to_string(),
                });
            }
            let query_id = self.last_query_id.fetch_add(1, Ordering::Relaxed) + 1;
            *slot = InfoSlot::Waiting {
                query_id,
                lines: Vec::new(),
            };
            query_id
        };

        submit(WireMessage::InfoRequest { query_id, query });

        let deadline = Instant::now() + timeout;
        let mut slot = lock(&self.info);
        loop {
            match mem::replace(&mut *slot, InfoSlot::Idle) {
                InfoSlot::Done(result) => return result,
                waiting => *slot = waiting,
            }
            let now = Instant::now();
            if now >= deadline {
                *slot = InfoSlot::Idle;
                return Err(InfoError::Timeout {
                    host: self.id().to_string(),
                    timeout_ms: timeout.as_millis(),
                });
            }
            slot = self
                .info_ready
                .wait_timeout(slot, deadline - now)
                .map(|(slot, _)| slot)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }

    pub fn info_pending(&self) -> bool {
        matches!(*lock(&self.info), InfoSlot::Waiting { .. })
    }

    /// One line of the answer to query `query_id`
    pub fn info_line(&self, query_id: u64, text: String) {
        match &mut *lock(&self.info) {
            InfoSlot::Waiting { query_id: running, lines } if *running == query_id => lines.push(text),
            _ => debug!("Host '{}': dropping line of stale info answer {}", self.id(), query_id),
        }
    }

    /// End of the answer to query `query_id`
    pub fn info_end(&self, query_id: u64, ok: bool) {
        let mut slot = lock(&self.info);
        let text = match &mut *slot {
            InfoSlot::Waiting { query_id: running, lines } if *running == query_id => {
                mem::take(lines).join("\n")
            }
            _ => {
                debug!("Host '{}': dropping end of stale info answer {}", self.id(), query_id);
                return;
            }
        };
        *slot = InfoSlot::Done(if ok {
            Ok(text)
        } else {
            Err(InfoError::Failed {
                host: self.id().to_string(),
                detail: text,
            })
        });
        self.info_ready.notify_all();
    }

    /// Fails the running query because the connection went away.
    pub fn info_abort(&self) {
        let mut slot = lock(&self.info);
        if let InfoSlot::Waiting { .. } = &*slot {
            *slot = InfoSlot::Done(Err(InfoError::Disconnected {
                host: self.id().to_string(),
            }));
            self.info_ready.notify_all();
        }
    }

    /// Status text; verbosity 1 adds liveness and errors, 2 adds connector
    /// details.
    pub fn info(&self, verbosity: u8) -> String {
        let mut out = format!("{} {} {}", self.id(), self.entry.net_address(), self.state());
        if verbosity >= 1 {
            match self.last_alive() {
                Some(t) => {
                    let _ = write!(out, " alive={}", t);
                }
                None => out.push_str(" alive=never"),
            }
            if !self.resources_known() {
                out.push_str(" resources=unknown");
            }
        }
        let connector = self.connector_info();
        if verbosity >= 1 {
            if let Some(error) = &connector.last_error {
                let _ = write!(out, " error=\"{}\"", error);
            }
        }
        if verbosity >= 2 {
            if let Some(address) = connector.address {
                let _ = write!(out, "\n  address {}", address);
            }
            if let Some(t) = connector.last_attempt {
                let _ = write!(out, "\n  last attempt {}", t);
            }
            let _ = write!(out, "\n  write pending {}", self.write_pending());
        }
        out
    }
}
