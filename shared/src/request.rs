use crate::{time::Timestamp, value::Value};

/// Priority assigned to requests that do not specify one
pub const DEFAULT_PRIORITY: u8 = 5;

/// A wish to drive a resource to some value.
///
/// Several requests may exist for one resource; the active request with
/// the highest priority determines what the driver is asked to do.
#[derive(Clone, Debug, PartialEq)]
pub struct Request {
    id: String,
    value: Value,
    priority: u8,
    t1: Option<Timestamp>,
}

impl Request {
    pub fn new(id: &str, value: Value) -> Self {
        Self {
            id: id.to_string(),
            value,
            priority: DEFAULT_PRIORITY,
            t1: None,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// The request is dropped once `t1` has passed.
    pub fn with_expiry(mut self, t1: Timestamp) -> Self {
        self.t1 = Some(t1);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn t1(&self) -> Option<Timestamp> {
        self.t1
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        matches!(self.t1, Some(t1) if t1 <= now)
    }

    pub(crate) fn qualify(&mut self, host: &str) {
        if !self.id.contains('/') {
            self.id = format!("{}/{}", host, self.id);
        }
    }
}

/// Requests attached to one resource, in the order they were set
#[derive(Default)]
pub(crate) struct RequestSet {
    requests: Vec<Request>,
}

impl RequestSet {
    /// Replaces a request with the same id, or appends.
    pub fn set(&mut self, request: Request) {
        self.requests.retain(|r| r.id != request.id);
        self.requests.push(request);
    }

    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.requests.len();
        self.requests.retain(|r| r.id != id);
        before != self.requests.len()
    }

    pub fn prune(&mut self, now: Timestamp) {
        self.requests.retain(|r| !r.is_expired(now));
    }

    /// Highest priority wins; among equals, the most recently set one.
    pub fn winner(&self, now: Timestamp) -> Option<&Request> {
        let mut best: Option<&Request> = None;
        for request in self.requests.iter().filter(|r| !r.is_expired(now)) {
            match best {
                Some(b) if b.priority > request.priority => {}
                _ => best = Some(request),
            }
        }
        best
    }

    pub fn iter(&self) -> impl Iterator<Item = &Request> {
        self.requests.iter()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(id: &str, v: i64, prio: u8) -> Request {
        Request::new(id, Value::Int(v)).with_priority(prio)
    }

    #[test]
    fn highest_priority_wins_latest_breaks_ties() {
        let mut set = RequestSet::default();
        set.set(req("a", 1, 5));
        set.set(req("b", 2, 7));
        set.set(req("c", 3, 7));
        let now = Timestamp::from_millis(10);
        assert_eq!(set.winner(now).map(|r| r.id()), Some("c"));

        set.remove("c");
        assert_eq!(set.winner(now).map(|r| r.id()), Some("b"));
    }

    #[test]
    fn expired_requests_are_ignored() {
        let mut set = RequestSet::default();
        set.set(req("a", 1, 5));
        set.set(req("b", 2, 9).with_expiry(Timestamp::from_millis(100)));
        assert_eq!(set.winner(Timestamp::from_millis(99)).map(|r| r.id()), Some("b"));
        assert_eq!(set.winner(Timestamp::from_millis(100)).map(|r| r.id()), Some("a"));

        set.prune(Timestamp::from_millis(100));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn setting_same_id_replaces() {
        let mut set = RequestSet::default();
        set.set(req("a", 1, 5));
        set.set(req("a", 4, 5));
        assert_eq!(set.len(), 1);
        assert_eq!(set.winner(Timestamp::EPOCH).map(|r| r.value()), Some(&Value::Int(4)));
    }
}
