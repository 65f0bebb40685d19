use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::redact::Redactor;

/// Well-known event names emitted by the engine.
pub mod names {
    pub const RUN_STARTED: &str = "RunStarted";
    pub const STEP_NOT_APPLICABLE: &str = "StepNotApplicable";
    pub const STEP_STARTED: &str = "StepStarted";
    pub const STEP_RETRYING: &str = "StepRetrying";
    pub const STEP_COMPLETED: &str = "StepCompleted";
    pub const STEP_FAILED: &str = "StepFailed";
    pub const ON_FAILURE_STARTED: &str = "OnFailureStarted";
    pub const ON_FAILURE_COMPLETED: &str = "OnFailureCompleted";
    pub const RUN_COMPLETED: &str = "RunCompleted";
    pub const CUSTOM: &str = "Custom";
}

/// One entry of the append-only run event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Event {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub name: String,
    pub message: String,
    pub step_name: Option<String>,
    pub data: Value,
}

/// Receives events live, in order, as the engine emits them.
pub trait EventSink: Send + Sync + 'static {
    fn write_event(&self, event: &Event);
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: Event) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventSink for EventBus {
    fn write_event(&self, event: &Event) {
        self.publish(event.clone());
    }
}

/// Per-run event buffer with optional live forwarding.
///
/// Cloning shares the same buffer and sequence counter, so handlers can emit
/// custom events that interleave correctly with engine events. Event data is
/// redacted before it is buffered or forwarded.
#[derive(Clone)]
pub struct EventRecorder {
    buffer: Arc<Mutex<Vec<Event>>>,
    sequence: Arc<AtomicU64>,
    sink: Option<Arc<dyn EventSink>>,
    redactor: Arc<Redactor>,
}

impl EventRecorder {
    pub fn new(sink: Option<Arc<dyn EventSink>>, redactor: Arc<Redactor>) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(Vec::new())),
            sequence: Arc::new(AtomicU64::new(0)),
            sink,
            redactor,
        }
    }

    pub fn emit(
        &self,
        name: &str,
        message: impl Into<String>,
        step_name: Option<&str>,
        data: Value,
    ) {
        // Hold the lock across sequencing and forwarding so the sink sees buffer order.
        let mut buffer = match self.buffer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let event = Event {
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
            timestamp: Utc::now(),
            name: name.to_string(),
            message: message.into(),
            step_name: step_name.map(str::to_string),
            data: self.redactor.redact(&data),
        };
        if let Some(sink) = &self.sink {
            sink.write_event(&event);
        }
        buffer.push(event);
    }

    /// Snapshot of everything emitted so far.
    pub fn events(&self) -> Vec<Event> {
        match self.buffer.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl std::fmt::Debug for EventRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRecorder")
            .field("events", &self.events().len())
            .field("sink", &self.sink.is_some())
            .finish()
    }
}
