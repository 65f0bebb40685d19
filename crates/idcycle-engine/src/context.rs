use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::info;

use idcycle_core::error::{Result, SessionError};
use idcycle_core::event::{Event, EventRecorder};
use idcycle_core::security::assert_no_executable_content;
use idcycle_core::traits::{ProviderRegistry, StepContext};
use idcycle_core::types::{Plan, PlanStep, SessionHandle};

/// State owned by exactly one `execute` call.
///
/// Holds the run's event recorder and is the only place auth sessions are
/// acquired. Handlers see a narrower [`StepContext`].
pub struct ExecutionContext {
    correlation_id: String,
    actor: Option<String>,
    providers: Arc<ProviderRegistry>,
    events: EventRecorder,
}

impl ExecutionContext {
    pub fn new(plan: &Plan, providers: Arc<ProviderRegistry>, events: EventRecorder) -> Self {
        Self {
            correlation_id: plan.correlation_id.clone(),
            actor: plan.request.actor.clone(),
            providers,
            events,
        }
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn actor(&self) -> Option<&str> {
        self.actor.as_deref()
    }

    pub fn providers(&self) -> &Arc<ProviderRegistry> {
        &self.providers
    }

    pub fn emit(&self, name: &str, message: impl Into<String>, step_name: Option<&str>, data: Value) {
        self.events.emit(name, message, step_name, data);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.events()
    }

    pub fn step_context(&self, step: &PlanStep) -> StepContext {
        StepContext::new(
            self.correlation_id.clone(),
            self.actor.clone(),
            step,
            self.providers.clone(),
            self.events.clone(),
        )
    }

    /// Resolve the auth session `name` on behalf of `step_name`.
    pub fn acquire_auth_session(
        &self,
        step_name: &str,
        name: &str,
        options: Option<&Map<String, Value>>,
    ) -> Result<SessionHandle> {
        if let Some(options) = options {
            assert_no_executable_content(&Value::Object(options.clone()), "AuthSessionOptions")?;
        }
        let acquirer = self
            .providers
            .auth_sessions()
            .ok_or_else(|| SessionError::NotConfigured {
                step: step_name.to_string(),
                name: name.to_string(),
            })?;
        let handle = acquirer.acquire(name, options)?;
        info!(step = %step_name, session = %name, "Auth session acquired");
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use idcycle_core::error::IdcycleError;
    use idcycle_core::redact::Redactor;
    use idcycle_test_utils::StaticAcquirer;
    use serde_json::json;

    fn plan() -> Plan {
        Plan {
            workflow_name: "wf".into(),
            lifecycle_event: "Joiner".into(),
            correlation_id: "corr-1".into(),
            request: idcycle_test_utils::fixtures::request("Joiner"),
            steps: vec![],
            on_failure_steps: vec![],
            created_utc: chrono::Utc::now(),
        }
    }

    fn context(providers: ProviderRegistry) -> ExecutionContext {
        ExecutionContext::new(
            &plan(),
            Arc::new(providers),
            EventRecorder::new(None, Arc::new(Redactor::default())),
        )
    }

    #[test]
    fn missing_acquirer_is_not_configured() {
        let ctx = context(ProviderRegistry::new());
        match ctx.acquire_auth_session("Create", "AD", None) {
            Err(IdcycleError::Session(SessionError::NotConfigured { step, name })) => {
                assert_eq!(step, "Create");
                assert_eq!(name, "AD");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn acquires_through_registry_acquirer() {
        let acquirer = Arc::new(StaticAcquirer::returning(SessionHandle::new("s")));
        let ctx = context(ProviderRegistry::new().with_auth_sessions(acquirer.clone()));
        let opts = json!({ "Role": "Admin" }).as_object().cloned().unwrap();
        let handle = ctx.acquire_auth_session("Create", "AD", Some(&opts)).unwrap();
        assert_eq!(handle.downcast_ref::<&str>(), Some(&"s"));
        assert_eq!(acquirer.calls(), vec![("AD".to_string(), Some(opts))]);
    }

    #[test]
    fn executable_options_never_reach_acquirer() {
        let acquirer = Arc::new(StaticAcquirer::returning(SessionHandle::new("s")));
        let ctx = context(ProviderRegistry::new().with_auth_sessions(acquirer.clone()));
        let opts = json!({ "Role": { "$code": "x" } }).as_object().cloned().unwrap();
        assert!(matches!(
            ctx.acquire_auth_session("Create", "AD", Some(&opts)),
            Err(IdcycleError::SecurityViolation { .. })
        ));
        assert!(acquirer.calls().is_empty());
    }
}
