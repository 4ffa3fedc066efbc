/// END-TO-END TESTS: pattern subscriptions picking up resources that appear
/// after the subscription was made
use std::time::Duration;

use reslink_shared::{RcType, Value, ValueState};
use reslink_test::{assert_eventually, fast_net_config, subscriber, TestNode};

#[test]
fn local_pattern_links_later_registrations_once() {
    let node = TestNode::builder("alpha").driver("drv").start();
    let core = node.core();

    let (sub, events) = subscriber(core, "ui");
    assert_eq!(core.subscribe(sub, "/local/drv/zone/*", false), Ok(true));
    assert!(core.subscriber_resources(sub).is_empty());
    assert_eq!(core.watch_patterns(sub), vec!["/host/alpha/drv/zone/*".to_string()]);

    let zone = core.register_resource("drv", "zone/1", RcType::Float).unwrap();
    assert_eq!(core.link_count(zone), 1);
    assert_eq!(core.subscriber_resources(sub), vec![zone]);

    core.report_value(zone, ValueState::valid(Value::Float(21.5)))
        .unwrap();
    assert_eq!(events.count(), 1);
    assert_eq!(events.last().unwrap().uri, "/host/alpha/drv/zone/1");
}

#[test]
fn remote_pattern_follows_the_owners_resource_list() {
    let alpha = TestNode::builder("alpha").driver("drv").listening().start();
    let mut net = fast_net_config();
    net.age_interval = Duration::from_millis(200);
    let beta = TestNode::builder("beta")
        .peer("alpha", alpha.local_addr().unwrap())
        .net(net)
        .start();
    assert_eventually!(
        beta.host("alpha").unwrap().resources_known(),
        "resource list never arrived"
    );

    let (sub, events) = subscriber(beta.core(), "ui");
    assert_eq!(beta.core().subscribe(sub, "/host/alpha/drv/zone/*", false), Ok(true));
    assert!(beta.core().subscriber_resources(sub).is_empty());

    let zone = alpha
        .core()
        .register_resource("drv", "zone/1", RcType::Int)
        .unwrap();
    alpha
        .core()
        .report_value(zone, ValueState::valid(Value::Int(5)))
        .unwrap();

    // Found by the next periodic refresh of the resource list
    assert_eventually!(
        events.count_of(&ValueState::valid(Value::Int(5))) == 1,
        "new resource was never subscribed"
    );
    let mirror = beta
        .core()
        .get_resource("/host/alpha/drv/zone/1", false)
        .unwrap();
    assert_eq!(beta.core().link_count(mirror), 1);
    assert_eq!(alpha.core().link_count(zone), 1);

    // Further refreshes do not subscribe again
    std::thread::sleep(Duration::from_millis(500));
    assert_eq!(events.count(), 1);
    assert_eq!(alpha.core().link_count(zone), 1);
}
