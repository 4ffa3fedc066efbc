/// END-TO-END TESTS: requests and introspection queries sent to a peer
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use reslink_client::{HostState, InfoError};
use reslink_server::Node;
use reslink_shared::{RcType, Request, ResourceKey, Timestamp, Value, ValueState};
use reslink_test::{assert_eventually, assert_host_state, fast_net_config, subscriber, TestNode};

type Driven = Arc<Mutex<Vec<Option<(String, u8, Value)>>>>;

/// "alpha" with a driver that records what it is asked to do
fn owner() -> (Node, ResourceKey, Driven) {
    let node = TestNode::builder("alpha").driver("gpio").listening().start();
    let driven: Driven = Arc::new(Mutex::new(Vec::new()));
    let recorder = driven.clone();
    node.core()
        .attach_driver(
            "gpio",
            Arc::new(move |_: ResourceKey, request: Option<&Request>| {
                recorder.lock().unwrap().push(
                    request.map(|r| (r.id().to_string(), r.priority(), r.value().clone())),
                );
            }),
        )
        .unwrap();
    let relay = node
        .core()
        .register_resource("gpio", "relay", RcType::Int)
        .unwrap();
    node.core()
        .report_value(relay, ValueState::valid(Value::Int(0)))
        .unwrap();
    (node, relay, driven)
}

fn last_driven(driven: &Driven) -> Option<Option<(String, u8, Value)>> {
    driven.lock().unwrap().last().cloned()
}

// ========== Request Tests ==========

#[test]
fn remote_request_drives_the_owner() {
    let (alpha, relay, driven) = owner();
    let beta = TestNode::builder("beta")
        .peer("alpha", alpha.local_addr().unwrap())
        .start();

    let mirror = beta
        .core()
        .get_resource("/host/alpha/gpio/relay", true)
        .expect("mirror after the resource list arrived");
    beta.core()
        .set_request(mirror, Request::new("scene", Value::Int(1)).with_priority(7))
        .unwrap();

    assert_eventually!(
        last_driven(&driven) == Some(Some(("beta/scene".to_string(), 7, Value::Int(1)))),
        "request never reached the driver"
    );
    assert_eq!(
        alpha.core().active_request(relay).map(|r| r.id().to_string()),
        Some("beta/scene".to_string())
    );
    assert!(beta.core().has_remote_demand("alpha"));

    beta.core().del_request(mirror, "scene", None).unwrap();
    assert_eventually!(last_driven(&driven) == Some(None), "deletion never reached the driver");
    assert!(!beta.core().has_remote_demand("alpha"));
}

#[test]
fn expiring_request_is_forwarded_with_its_deadline() {
    let (alpha, relay, _driven) = owner();
    let beta = TestNode::builder("beta")
        .peer("alpha", alpha.local_addr().unwrap())
        .start();
    let mirror = beta
        .core()
        .get_resource("/host/alpha/gpio/relay", true)
        .unwrap();

    let t1 = Timestamp::now_or_epoch().after(std::time::Duration::from_secs(3600));
    beta.core()
        .set_request(mirror, Request::new("timer", Value::Int(3)).with_expiry(t1))
        .unwrap();
    assert_eventually!(
        alpha.core().active_request(relay).and_then(|r| r.t1()) == Some(t1),
        "expiry did not survive the wire"
    );
}

// ========== Shutdown Tests ==========

#[test]
fn stopping_flushes_requests_to_idle_hosts() {
    let (alpha, _relay, driven) = owner();
    let mut net = fast_net_config();
    net.idle_timeout = Duration::from_millis(300);
    let mut beta = TestNode::builder("beta")
        .peer("alpha", alpha.local_addr().unwrap())
        .net(net)
        .start();
    let mirror = beta
        .core()
        .get_resource("/host/alpha/gpio/relay", true)
        .unwrap();
    assert_host_state!(beta, "alpha", HostState::Standby);

    beta.core()
        .set_request(mirror, Request::new("scene", Value::Int(4)))
        .unwrap();
    beta.stop();

    assert_eventually!(
        driven
            .lock()
            .unwrap()
            .iter()
            .any(|r| r.as_ref().is_some_and(|(id, _, value)| id == "beta/scene" && *value == Value::Int(4))),
        "request queued before stopping never reached the driver"
    );
}

// ========== Info Tests ==========

#[test]
fn resource_info_from_the_owner() {
    let (alpha, _relay, _driven) = owner();
    let beta = TestNode::builder("beta")
        .peer("alpha", alpha.local_addr().unwrap())
        .start();

    assert_eq!(
        beta.remote_info_resource("/host/alpha/gpio/relay", 0),
        Ok("/host/alpha/gpio/relay int =0".to_string())
    );
    assert_eq!(
        beta.remote_info_resource("/host/alpha/gpio/none", 0),
        Err(InfoError::Failed {
            host: "alpha".to_string(),
            detail: "unknown resource 'gpio/none'".to_string()
        })
    );
    // Local resources are answered without the network
    assert_eq!(
        alpha.remote_info_resource("/local/gpio/relay", 0),
        Ok("/host/alpha/gpio/relay int =0".to_string())
    );
    assert!(matches!(
        beta.remote_info_resource("/env/LANG", 0),
        Err(InfoError::Failed { .. })
    ));
}

#[test]
fn subscriber_info_shows_agents() {
    let (alpha, relay, _driven) = owner();
    let beta = TestNode::builder("beta")
        .peer("alpha", alpha.local_addr().unwrap())
        .start();

    let (sub, events) = subscriber(beta.core(), "ui");
    beta.core()
        .subscribe(sub, "/host/alpha/gpio/relay", true)
        .unwrap();
    assert_eventually!(alpha.core().link_count(relay) == 1, "subscription never arrived");
    assert_eventually!(events.count() == 1, "current value never arrived");

    let remote = beta.remote_info_subscribers("alpha", 1).unwrap();
    assert!(remote.contains("beta/ui (agent of beta, 1 resources)"));
    assert!(remote.contains("/host/alpha/gpio/relay =0"));

    let local = beta.remote_info_subscribers("beta", 0).unwrap();
    assert_eq!(local, "beta/ui (local, 1 resources)\n");

    assert_eq!(
        beta.remote_info_subscribers("gamma", 0),
        Err(InfoError::UnknownHost {
            host: "gamma".to_string()
        })
    );

    let status = alpha.info_all(1).unwrap();
    assert!(status.starts_with("node alpha\n"));
    assert!(status.contains(" beta connected agents=1"));
    assert!(status.contains("  agent beta/ui"));

    let status = beta.info_all(0).unwrap();
    assert!(status.contains("alpha 127.0.0.1:"));
}
