use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use serde_json::{Map, Value};

use idcycle_core::error::{IdcycleError, Result};
use idcycle_core::traits::{StepContext, StepHandler, StepInput};
use idcycle_core::types::{SessionHandle, StepOutcome};

/// One scripted reply. The last entry repeats once the script runs out.
#[derive(Debug, Clone)]
pub enum Scripted {
    Ok(StepOutcome),
    Transient(String),
    Fail(String),
}

/// Step handler replaying a fixed script of outcomes.
///
/// Clones share the invocation counter and recorded inputs, so a test can keep
/// one copy while the registry owns another.
#[derive(Clone)]
pub struct ScriptedHandler {
    step_type: String,
    description: String,
    supports_session: bool,
    capabilities: Vec<String>,
    script: Arc<Vec<Scripted>>,
    calls: Arc<AtomicU32>,
    sessions: Arc<Mutex<Vec<Option<SessionHandle>>>>,
    inputs: Arc<Mutex<Vec<Map<String, Value>>>>,
}

impl ScriptedHandler {
    pub fn new(step_type: &str, script: Vec<Scripted>) -> Self {
        Self {
            step_type: step_type.to_string(),
            description: format!("scripted {}", step_type),
            supports_session: false,
            capabilities: vec![],
            script: Arc::new(script),
            calls: Arc::new(AtomicU32::new(0)),
            sessions: Arc::new(Mutex::new(vec![])),
            inputs: Arc::new(Mutex::new(vec![])),
        }
    }

    /// Always completes with `Changed = true`.
    pub fn ok(step_type: &str) -> Self {
        Self::new(step_type, vec![Scripted::Ok(StepOutcome::changed())])
    }

    /// Always fails with a non-transient error.
    pub fn failing(step_type: &str, message: &str) -> Self {
        Self::new(step_type, vec![Scripted::Fail(message.to_string())])
    }

    /// Fails transiently `failures` times, then completes.
    pub fn transient_then_ok(step_type: &str, failures: usize) -> Self {
        let mut script: Vec<Scripted> = (0..failures)
            .map(|i| Scripted::Transient(format!("throttled #{}", i + 1)))
            .collect();
        script.push(Scripted::Ok(StepOutcome::changed()));
        Self::new(step_type, script)
    }

    pub fn always_transient(step_type: &str, message: &str) -> Self {
        Self::new(step_type, vec![Scripted::Transient(message.to_string())])
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_session_support(mut self) -> Self {
        self.supports_session = true;
        self
    }

    pub fn with_capabilities(mut self, capabilities: &[&str]) -> Self {
        self.capabilities = capabilities.iter().map(|c| c.to_string()).collect();
        self
    }

    /// Number of times `execute` was invoked.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Session handle passed on each invocation.
    pub fn sessions(&self) -> Vec<Option<SessionHandle>> {
        self.sessions.lock().unwrap().clone()
    }

    /// `With` record passed on each invocation.
    pub fn inputs(&self) -> Vec<Map<String, Value>> {
        self.inputs.lock().unwrap().clone()
    }
}

impl StepHandler for ScriptedHandler {
    fn step_type(&self) -> &str {
        &self.step_type
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn supports_session(&self) -> bool {
        self.supports_session
    }

    fn required_capabilities(&self) -> Vec<String> {
        self.capabilities.clone()
    }

    fn execute(&self, input: StepInput, _ctx: StepContext) -> BoxFuture<'_, Result<StepOutcome>> {
        Box::pin(async move {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            self.sessions.lock().unwrap().push(input.session.clone());
            self.inputs.lock().unwrap().push(input.with.clone());
            match self.script.get(n).or(self.script.last()) {
                Some(Scripted::Ok(outcome)) => Ok(outcome.clone()),
                Some(Scripted::Transient(msg)) => Err(IdcycleError::transient(msg.clone())),
                Some(Scripted::Fail(msg)) => Err(IdcycleError::step(msg.clone())),
                None => Ok(StepOutcome::default()),
            }
        })
    }
}
