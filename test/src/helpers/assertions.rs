/// Assert that a condition becomes true within `WAIT_TIMEOUT`
#[macro_export]
macro_rules! assert_eventually {
    ($cond:expr, $($arg:tt)+) => {
        assert!(
            $crate::helpers::wait_until($crate::helpers::WAIT_TIMEOUT, || $cond),
            $($arg)+
        );
    };
}

/// Assert that a host reaches the given state within `WAIT_TIMEOUT`
#[macro_export]
macro_rules! assert_host_state {
    ($node:expr, $host:expr, $state:expr) => {
        let host = $node.host($host).expect("host is in the directory");
        assert!(
            $crate::helpers::wait_until($crate::helpers::WAIT_TIMEOUT, || host.state() == $state),
            "Host '{}' stayed in state {} instead of reaching {}",
            $host,
            host.state(),
            $state
        );
    };
}
