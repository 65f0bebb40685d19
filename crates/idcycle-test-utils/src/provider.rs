use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};

use idcycle_core::error::{Result, SessionError};
use idcycle_core::traits::{AuthSessionAcquirer, Provider, StepHandler};
use idcycle_core::types::SessionHandle;

/// Provider with fixed capabilities and config and no domain operations.
pub struct StaticProvider {
    kind: String,
    capabilities: Vec<String>,
    config: Value,
    handlers: Vec<Arc<dyn StepHandler>>,
}

impl StaticProvider {
    pub fn new(kind: &str, capabilities: &[&str]) -> Self {
        Self {
            kind: kind.to_string(),
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
            config: Value::Null,
            handlers: vec![],
        }
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn with_handler(mut self, handler: impl StepHandler) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }
}

impl Provider for StaticProvider {
    fn kind(&self) -> &str {
        &self.kind
    }

    fn capabilities(&self) -> Vec<String> {
        self.capabilities.clone()
    }

    fn config(&self) -> Value {
        self.config.clone()
    }

    fn step_handlers(&self) -> Vec<Arc<dyn StepHandler>> {
        self.handlers.clone()
    }
}

/// Acquirer returning one fixed outcome and recording every request.
pub struct StaticAcquirer {
    outcome: std::result::Result<SessionHandle, SessionError>,
    calls: Mutex<Vec<(String, Option<Map<String, Value>>)>>,
}

impl StaticAcquirer {
    pub fn returning(handle: SessionHandle) -> Self {
        Self {
            outcome: Ok(handle),
            calls: Mutex::new(vec![]),
        }
    }

    pub fn failing(error: SessionError) -> Self {
        Self {
            outcome: Err(error),
            calls: Mutex::new(vec![]),
        }
    }

    /// `(name, options)` for each acquire call, in order.
    pub fn calls(&self) -> Vec<(String, Option<Map<String, Value>>)> {
        self.calls.lock().unwrap().clone()
    }
}

impl AuthSessionAcquirer for StaticAcquirer {
    fn acquire(&self, name: &str, options: Option<&Map<String, Value>>) -> Result<SessionHandle> {
        self.calls
            .lock()
            .unwrap()
            .push((name.to_string(), options.cloned()));
        self.outcome.clone().map_err(Into::into)
    }
}
