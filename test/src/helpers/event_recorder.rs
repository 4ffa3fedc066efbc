use std::sync::{Mutex, MutexGuard};

use reslink_shared::{EventSink, ResourceEvent, SubscriberKey, ValueState};

/// Event sink remembering everything it was handed
#[derive(Default)]
pub struct EventRecorder {
    events: Mutex<Vec<ResourceEvent>>,
}

impl EventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ResourceEvent>> {
        self.events.lock().expect("recorder lock poisoned")
    }

    pub fn count(&self) -> usize {
        self.lock().len()
    }

    pub fn events(&self) -> Vec<ResourceEvent> {
        self.lock().clone()
    }

    pub fn last(&self) -> Option<ResourceEvent> {
        self.lock().last().cloned()
    }

    /// Value/state carried by the most recent event
    pub fn last_value(&self) -> Option<ValueState> {
        self.last().map(|event| event.value_state)
    }

    /// Number of events carrying `value_state`
    pub fn count_of(&self, value_state: &ValueState) -> usize {
        self.lock()
            .iter()
            .filter(|event| &event.value_state == value_state)
            .count()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

impl EventSink for EventRecorder {
    fn on_event(&self, _subscriber: SubscriberKey, event: ResourceEvent) {
        log::trace!("Recorded {} {}", event.uri, event.value_state);
        self.lock().push(event);
    }
}
