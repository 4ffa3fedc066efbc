pub mod assertions;
pub mod event_recorder;
pub mod test_node;
pub mod wait;

pub use event_recorder::EventRecorder;
pub use test_node::{fast_net_config, init_logging, subscriber, TestNode};
pub use wait::{wait_until, WAIT_TIMEOUT};
