use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use reslink_client::{HostAction, HostLink, HostOpcode, HostState};
use reslink_shared::{
    Directory, DirectoryConfig, NetConfig, RcType, RemoteGateway, ResourceCore, ResourceEvent,
    SubscriberKey, Value, ValueState, WireMessage,
};

fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

fn config() -> NetConfig {
    NetConfig {
        net_timeout: ms(500),
        retry_min: ms(100),
        retry_max: ms(800),
        retry_give_up: ms(5000),
        idle_timeout: ms(1000),
        age_interval: ms(10_000),
        alive_interval: ms(1000),
        alive_timeout: ms(3000),
    }
}

/// A link that has finished its first connect, still in the `New` phase
fn new_connected(now: Instant) -> HostLink {
    let mut link = HostLink::new("beta", &config(), now);
    assert_eq!(
        link.handle(HostOpcode::Timer, false, now),
        vec![HostAction::Connect { attempt: 1 }]
    );
    assert_eq!(
        link.handle(HostOpcode::ConnectSuccess, false, now),
        vec![HostAction::Greet]
    );
    assert_eq!(link.state(), HostState::NewConnected);
    link
}

/// A link whose resource list is known
fn established(now: Instant) -> HostLink {
    let mut link = new_connected(now);
    assert!(link.resources_complete(now));
    assert_eq!(link.state(), HostState::Connected);
    link
}

// ========== Startup Tests ==========

#[test]
fn new_host_connects_at_once() {
    let now = Instant::now();
    let mut link = HostLink::new("beta", &config(), now);
    assert_eq!(link.state(), HostState::NewRetryWait);
    assert_eq!(link.next_deadline(), Some(now));

    let actions = link.handle(HostOpcode::Timer, false, now);
    assert_eq!(actions, vec![HostAction::Connect { attempt: 1 }]);
    assert_eq!(link.state(), HostState::NewConnecting);
    assert_eq!(link.next_deadline(), None);
}

#[test]
fn send_connects_and_flushes_after_greeting() {
    let now = Instant::now();
    let mut link = HostLink::new("beta", &config(), now);
    link.queue(&WireMessage::Alive);
    assert!(link.has_pending());

    assert_eq!(
        link.handle(HostOpcode::Send, true, now),
        vec![HostAction::Connect { attempt: 1 }]
    );
    assert!(link.state().is_connecting());
    // Nothing to do while the connector runs
    assert!(link.handle(HostOpcode::Send, true, now).is_empty());

    assert_eq!(
        link.handle(HostOpcode::ConnectSuccess, true, now),
        vec![HostAction::Greet, HostAction::Write("alive\n".to_string())]
    );
    assert!(!link.has_pending());
}

#[test]
fn connect_results_outside_connecting_are_ignored() {
    let now = Instant::now();
    let mut link = HostLink::new("beta", &config(), now);
    assert!(link.handle(HostOpcode::ConnectSuccess, false, now).is_empty());
    assert!(link.handle(HostOpcode::ConnectFailed, false, now).is_empty());
    assert_eq!(link.state(), HostState::NewRetryWait);

    let mut link = established(now);
    assert!(link.handle(HostOpcode::ConnectSuccess, false, now).is_empty());
    assert_eq!(link.state(), HostState::Connected);
}

// ========== Retry Tests ==========

#[test]
fn failures_back_off_up_to_the_ceiling() {
    let config = config();
    let start = Instant::now();
    let mut link = HostLink::new("beta", &config, start);
    let mut now = start;
    let mut previous = Duration::ZERO;

    assert_eq!(
        link.handle(HostOpcode::Send, false, now),
        vec![HostAction::Connect { attempt: 1 }]
    );
    assert_eq!(link.state(), HostState::NewConnecting);

    for round in 1..=12u64 {
        assert!(link.handle(HostOpcode::ConnectFailed, false, now).is_empty());
        assert_eq!(link.state(), HostState::NewRetryWait);

        let interval = link.retry_interval().unwrap();
        assert!(interval >= previous);
        assert!(interval <= config.retry_max);
        previous = interval;

        let deadline = link.retry_deadline().unwrap();
        assert!(deadline > now);
        assert!(deadline >= now + interval);
        assert!(deadline <= now + interval + interval / 10);
        assert_eq!(link.next_deadline(), Some(deadline));

        // Too early: nothing happens
        assert!(link.handle(HostOpcode::Timer, false, now).is_empty());

        now = deadline;
        assert_eq!(
            link.handle(HostOpcode::Timer, false, now),
            vec![HostAction::Connect { attempt: round + 1 }]
        );
    }

    assert_eq!(previous, config.retry_max);
    // Well past the give-up time, but the resource list is still unknown
    assert!(now.duration_since(start) > config.retry_give_up);
    assert_eq!(link.state(), HostState::NewConnecting);
}

#[test]
fn established_host_gives_up_and_parks() {
    let config = config();
    let start = Instant::now();
    let mut link = established(start);

    assert_eq!(
        link.handle(HostOpcode::Disconnect, true, start),
        vec![HostAction::Close, HostAction::Invalidate]
    );
    assert_eq!(link.state(), HostState::RetryWait);
    assert_eq!(link.retry_deadline(), Some(start + config.retry_min));

    let mut now = start + config.retry_min;
    let mut parked = false;
    for _ in 0..20 {
        let actions = link.handle(HostOpcode::Timer, true, now);
        assert!(matches!(actions.as_slice(), [HostAction::Connect { .. }]));
        link.handle(HostOpcode::ConnectFailed, true, now);
        match link.state() {
            HostState::Standby => {
                parked = true;
                break;
            }
            HostState::RetryWait => now = link.retry_deadline().unwrap(),
            other => panic!("unexpected state {}", other),
        }
    }
    assert!(parked);
    assert_eq!(link.next_deadline(), None);
    assert_eq!(link.retry_interval(), None);

    // New demand wakes it up
    link.queue(&WireMessage::ListRequest);
    let actions = link.handle(HostOpcode::Send, true, now);
    assert!(matches!(actions.as_slice(), [HostAction::Connect { .. }]));
    assert_eq!(link.state(), HostState::Connecting);
}

#[test]
fn disconnect_while_connecting_cancels_the_attempt() {
    let config = config();
    let now = Instant::now();
    let mut link = HostLink::new("beta", &config, now);
    link.handle(HostOpcode::Timer, false, now);
    link.queue(&WireMessage::Alive);

    assert_eq!(
        link.handle(HostOpcode::Disconnect, false, now),
        vec![HostAction::CancelConnect]
    );
    assert_eq!(link.state(), HostState::NewRetryWait);
    assert_eq!(link.retry_deadline(), Some(now + config.retry_min));
    assert!(!link.has_pending());
}

// ========== Disconnect Tests ==========

#[test]
fn disconnect_without_demand_parks_established_hosts() {
    let now = Instant::now();
    let mut link = established(now);
    assert_eq!(
        link.handle(HostOpcode::Disconnect, false, now),
        vec![HostAction::Close, HostAction::Invalidate]
    );
    assert_eq!(link.state(), HostState::Standby);
    assert_eq!(link.next_deadline(), None);
}

#[test]
fn new_hosts_never_park() {
    let config = config();
    let now = Instant::now();
    let mut link = new_connected(now);
    assert_eq!(
        link.handle(HostOpcode::Disconnect, false, now),
        vec![HostAction::Close, HostAction::Invalidate]
    );
    assert_eq!(link.state(), HostState::NewRetryWait);
    assert_eq!(link.next_deadline(), Some(now + config.retry_min));
}

// ========== Timer Tests ==========

#[test]
fn idle_connection_is_closed_without_demand() {
    let config = config();
    let now = Instant::now();
    let mut link = established(now);

    // Demand keeps it open
    assert!(link
        .handle(HostOpcode::Timer, true, now + config.idle_timeout)
        .is_empty());
    assert_eq!(link.state(), HostState::Connected);

    let later = now + config.idle_timeout * 2;
    assert_eq!(
        link.handle(HostOpcode::Timer, false, later),
        vec![HostAction::Close, HostAction::Invalidate]
    );
    assert_eq!(link.state(), HostState::Standby);
}

#[test]
fn sending_resets_the_idle_timer() {
    let config = config();
    let now = Instant::now();
    let mut link = established(now);

    link.queue(&WireMessage::Alive);
    let half = now + config.idle_timeout / 2;
    assert_eq!(
        link.handle(HostOpcode::Send, false, half),
        vec![HostAction::Write("alive\n".to_string())]
    );
    assert!(link
        .handle(HostOpcode::Timer, false, now + config.idle_timeout)
        .is_empty());
    assert_eq!(link.next_deadline(), Some(half + config.idle_timeout));
}

#[test]
fn new_hosts_are_not_closed_for_idleness() {
    let config = config();
    let now = Instant::now();
    let mut link = new_connected(now);
    assert!(link
        .handle(HostOpcode::Timer, false, now + config.idle_timeout)
        .is_empty());
    assert_eq!(link.state(), HostState::NewConnected);
    assert_eq!(link.next_deadline(), Some(now + config.alive_timeout));
}

#[test]
fn silent_peer_is_disconnected() {
    let config = config();
    let now = Instant::now();
    let mut link = established(now);

    link.mark_heard(now + ms(2000));
    assert!(link
        .handle(HostOpcode::Timer, true, now + config.alive_timeout)
        .is_empty());

    let dead = now + ms(2000) + config.alive_timeout;
    assert_eq!(
        link.handle(HostOpcode::Timer, true, dead),
        vec![HostAction::Close, HostAction::Invalidate]
    );
    assert_eq!(link.state(), HostState::RetryWait);
}

#[test]
fn resource_list_is_refreshed_periodically() {
    let config = config();
    let now = Instant::now();
    let mut link = established(now);

    let due = now + config.age_interval;
    link.mark_heard(due);
    assert_eq!(
        link.handle(HostOpcode::Timer, true, due),
        vec![HostAction::RefreshResources]
    );
    assert!(link.handle(HostOpcode::Timer, true, due).is_empty());
}

#[test]
fn resources_complete_ends_the_new_phase_once() {
    let now = Instant::now();
    let mut link = new_connected(now);
    assert!(link.resources_complete(now));
    assert!(!link.resources_complete(now));
    assert!(!link.state().is_new());

    let mut idle = HostLink::new("gamma", &config(), now);
    assert!(!idle.resources_complete(now));
    assert_eq!(idle.state(), HostState::NewRetryWait);
}

#[test]
fn received_bytes_are_split_into_lines() {
    let now = Instant::now();
    let mut link = established(now);
    let messages = link.receive(b"alive\nlist-e", now);
    assert_eq!(messages, vec![Ok(WireMessage::Alive)]);
    let messages = link.receive(b"nd\nlaunch\n", now);
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0], Ok(WireMessage::ListEnd));
    assert!(messages[1].is_err());
}

// ========== Subscription Walkthrough ==========

#[derive(Default)]
struct Outbox {
    sent: Mutex<Vec<(String, WireMessage)>>,
}

impl RemoteGateway for Outbox {
    fn send(&self, host: &str, message: WireMessage) {
        self.sent.lock().unwrap().push((host.to_string(), message));
    }

    fn await_resources(&self, _host: &str, _timeout: Duration) -> bool {
        false
    }
}

#[test]
fn subscribing_wakes_a_parked_host() {
    let now = Instant::now();
    let directory = DirectoryConfig::new("alpha")
        .with_host("beta", "127.0.0.1", 4700)
        .with_driver("gpio");
    let core = ResourceCore::new(Arc::new(Directory::new(directory).unwrap()), &config());
    let outbox = Arc::new(Outbox::default());
    core.attach_gateway(outbox.clone());
    core.register_remote("beta", "drv/sensor1", RcType::Int).unwrap();

    let mut link = established(now);
    link.handle(HostOpcode::Disconnect, false, now);
    assert_eq!(link.state(), HostState::Standby);

    let calls = Arc::new(Mutex::new(Vec::new()));
    let recorder = calls.clone();
    let sub = core
        .new_subscriber(
            "ui",
            Arc::new(move |_: SubscriberKey, event: ResourceEvent| {
                recorder.lock().unwrap().push(event.value_state);
            }),
        )
        .unwrap();
    core.subscribe(sub, "/host/beta/drv/sensor1", false).unwrap();

    // What the engine does with the gateway's output
    let sent = std::mem::take(&mut *outbox.sent.lock().unwrap());
    assert_eq!(sent.len(), 1);
    for (host, message) in &sent {
        assert_eq!(host, "beta");
        link.queue(message);
    }
    assert_eq!(
        link.handle(HostOpcode::Send, true, now),
        vec![HostAction::Connect { attempt: 2 }]
    );
    assert_eq!(link.state(), HostState::Connecting);
    assert_eq!(
        link.handle(HostOpcode::ConnectSuccess, true, now),
        vec![
            HostAction::Greet,
            HostAction::Write("subscribe alpha/ui drv/sensor1\n".to_string())
        ]
    );
    assert_eq!(link.state(), HostState::Connected);

    for message in link.receive(b"value alpha/ui drv/sensor1 =42\n", now) {
        let Ok(WireMessage::Event {
            subscriber,
            lid,
            value,
        }) = message
        else {
            panic!("expected an event line");
        };
        assert_eq!(core.deliver_remote("beta", &subscriber, &lid, &value), Ok(true));
    }
    assert_eq!(
        *calls.lock().unwrap(),
        vec![ValueState::valid(Value::Int(42))]
    );
}
