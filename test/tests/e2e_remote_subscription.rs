/// END-TO-END TESTS: subscriptions across two nodes on the loopback interface
///
/// "alpha" owns the resources and listens, "beta" has alpha in its host
/// table and subscribes.
use std::{thread, time::Duration};

use reslink_client::HostState;
use reslink_server::Node;
use reslink_shared::{RcType, ResourceKey, Value, ValueState};
use reslink_test::{
    assert_eventually, assert_host_state, fast_net_config, subscriber, TestNode,
};

fn owner() -> (Node, ResourceKey) {
    let node = TestNode::builder("alpha").driver("gpio").listening().start();
    let lamp = node
        .core()
        .register_resource("gpio", "lamp", RcType::Int)
        .unwrap();
    node.core()
        .report_value(lamp, ValueState::valid(Value::Int(7)))
        .unwrap();
    (node, lamp)
}

fn peer_of(owner: &Node) -> TestNode {
    TestNode::builder("beta").peer("alpha", owner.local_addr().unwrap())
}

// ========== Value Propagation Tests ==========

#[test]
fn value_changes_reach_the_remote_subscriber() {
    let (alpha, lamp) = owner();
    let beta = peer_of(&alpha).start();

    let (sub, events) = subscriber(beta.core(), "ui");
    assert_eq!(beta.core().subscribe(sub, "/host/alpha/gpio/lamp", true), Ok(true));

    let current = ValueState::valid(Value::Int(7));
    assert_eventually!(events.count_of(&current) == 1, "current value never arrived");
    let first = events.last().unwrap();
    assert_eq!(first.uri, "/host/alpha/gpio/lamp");
    assert_eq!(first.lid, "gpio/lamp");

    alpha
        .core()
        .report_value(lamp, ValueState::busy(Value::Int(-42)))
        .unwrap();
    assert_eventually!(
        events.last_value().map(|v| v.encode()) == Some("!-42".to_string()),
        "changed value never arrived"
    );
    assert_eq!(events.count(), 2);
}

#[test]
fn text_values_survive_the_wire() {
    let alpha = TestNode::builder("alpha").driver("gpio").listening().start();
    let label = alpha
        .core()
        .register_resource("gpio", "label", RcType::String)
        .unwrap();
    let beta = peer_of(&alpha).alias("label", "/host/alpha/gpio/label").start();

    let (sub, events) = subscriber(beta.core(), "ui");
    assert_eq!(beta.core().subscribe(sub, "/alias/label", true), Ok(true));
    // Let the subscription reach alpha before the value changes
    assert_eventually!(alpha.core().link_count(label) == 1, "subscription never arrived");

    let text = ValueState::valid(Value::String("kitchen = ?!\\ done\nnext".to_string()));
    alpha.core().report_value(label, text.clone()).unwrap();
    assert_eventually!(events.count_of(&text) == 1, "text value never arrived intact");
}

#[test]
fn expired_values_turn_unknown_everywhere() {
    let (alpha, lamp) = owner();
    let beta = peer_of(&alpha).start();
    let (sub, events) = subscriber(beta.core(), "ui");
    beta.core().subscribe(sub, "/host/alpha/gpio/lamp", true).unwrap();
    assert_eventually!(events.count() == 1, "current value never arrived");

    alpha
        .core()
        .set_max_age(lamp, Some(Duration::from_millis(200)))
        .unwrap();
    let unknown = ValueState::unknown(RcType::Int);
    assert_eventually!(events.count_of(&unknown) == 1, "expiry never reached the subscriber");
    assert_eq!(alpha.core().value_state(lamp), Some(unknown));

    // Fresh values expire again
    alpha
        .core()
        .report_value(lamp, ValueState::valid(Value::Int(8)))
        .unwrap();
    assert_eventually!(
        events.count_of(&ValueState::unknown(RcType::Int)) == 2,
        "second expiry never reached the subscriber"
    );
}

#[test]
fn parked_host_wakes_up_for_a_subscription() {
    let (alpha, _lamp) = owner();
    let mut net = fast_net_config();
    net.idle_timeout = Duration::from_millis(300);
    let beta = peer_of(&alpha).net(net).start();

    // Startup fetches the resource list, then the idle connection is parked
    assert_eventually!(
        beta.host("alpha").unwrap().resources_known(),
        "resource list never arrived"
    );
    assert_host_state!(beta, "alpha", HostState::Standby);

    let (sub, events) = subscriber(beta.core(), "ui");
    assert_eq!(beta.core().subscribe(sub, "/host/alpha/gpio/lamp", false), Ok(true));
    assert_host_state!(beta, "alpha", HostState::Connected);

    let current = ValueState::valid(Value::Int(7));
    assert_eventually!(events.count() == 1, "current value never arrived");
    assert_eq!(events.last_value(), Some(current));

    // Exactly once, and the subscription keeps the connection open
    thread::sleep(Duration::from_millis(600));
    assert_eq!(events.count(), 1);
    assert_eq!(beta.host("alpha").unwrap().state(), HostState::Connected);
}

// ========== Connection Loss Tests ==========

#[test]
fn reconnect_restores_subscriptions() {
    let (alpha, lamp) = owner();
    let beta = peer_of(&alpha).start();

    let (sub, events) = subscriber(beta.core(), "ui");
    beta.core().subscribe(sub, "/host/alpha/gpio/lamp", true).unwrap();
    let current = ValueState::valid(Value::Int(7));
    assert_eventually!(events.count_of(&current) == 1, "current value never arrived");

    beta.disconnect_host("alpha").unwrap();
    assert_eventually!(
        events.count_of(&ValueState::unknown(RcType::Int)) == 1,
        "mirror was not invalidated"
    );
    // The subscription is re-sent and alpha answers with the current value
    assert_eventually!(events.count_of(&current) == 2, "subscription was not restored");
    assert_host_state!(beta, "alpha", HostState::Connected);

    // Exactly one agent left on alpha after the old connection is gone
    assert_eventually!(alpha.core().link_count(lamp) == 1, "stale agent was not released");
}

#[test]
fn stopped_owner_invalidates_mirrors() {
    let (mut alpha, _lamp) = owner();
    let beta = peer_of(&alpha).start();

    let (sub, events) = subscriber(beta.core(), "ui");
    beta.core().subscribe(sub, "/host/alpha/gpio/lamp", true).unwrap();
    assert_eventually!(events.count() == 1, "current value never arrived");

    alpha.stop();
    assert!(!alpha.is_running());
    assert_eventually!(
        events.last_value() == Some(ValueState::unknown(RcType::Int)),
        "mirror was not invalidated"
    );
    assert_eventually!(
        beta.host("alpha").unwrap().state() != HostState::Connected,
        "host still looks connected"
    );
}
