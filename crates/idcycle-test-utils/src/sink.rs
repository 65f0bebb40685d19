use std::sync::Mutex;

use idcycle_core::event::{Event, EventSink};

/// Event sink that keeps everything it receives.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<Event>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.name).collect()
    }
}

impl EventSink for RecordingSink {
    fn write_event(&self, event: &Event) {
        self.events.lock().unwrap().push(event.clone());
    }
}
