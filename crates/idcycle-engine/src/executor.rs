use std::sync::Arc;

use serde_json::json;
use tracing::{debug, error, info, warn};

use idcycle_core::config::EngineConfig;
use idcycle_core::error::{IdcycleError, Result};
use idcycle_core::event::{names, EventRecorder, EventSink};
use idcycle_core::redact::Redactor;
use idcycle_core::security::assert_no_executable_content;
use idcycle_core::traits::{ProviderRegistry, StepHandler, StepInput};
use idcycle_core::types::*;
use idcycle_steps::StepRegistry;

use crate::context::ExecutionContext;
use crate::retry::{retry_seed, RetryPolicy};

/// Runs a [`Plan`] to completion or failure.
///
/// Steps run strictly in order, one at a time. The main sequence stops at the
/// first failed step; on-failure steps then all run regardless of their own
/// failures.
pub struct Executor {
    registry: StepRegistry,
    retry: RetryPolicy,
    redactor: Arc<Redactor>,
}

impl Executor {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            registry: StepRegistry::with_builtins(),
            retry: RetryPolicy::from(&config.retry),
            redactor: Arc::new(Redactor::new(&config.redaction)),
        }
    }

    pub fn with_registry(mut self, registry: StepRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    /// Execute `plan` against `providers`, forwarding events live to `sink`.
    ///
    /// Returns `Err` only when the pre-run security checks reject the plan or
    /// the provider configuration; every failure after `RunStarted` is captured
    /// in the returned result.
    pub async fn execute(
        &self,
        plan: &Plan,
        providers: &ProviderRegistry,
        sink: Option<Arc<dyn EventSink>>,
    ) -> Result<ExecutionResult> {
        assert_no_executable_content(&serde_json::to_value(plan)?, "Plan")?;
        providers.assert_no_executable_config()?;

        let registry = self.registry.merged_with(providers);
        let providers = Arc::new(providers.clone());
        let events = EventRecorder::new(sink, self.redactor.clone());
        let ctx = ExecutionContext::new(plan, providers.clone(), events);

        info!(
            workflow = %plan.workflow_name,
            correlation_id = %plan.correlation_id,
            steps = plan.steps.len(),
            "Run started"
        );
        ctx.emit(
            names::RUN_STARTED,
            format!("Run started: {}", plan.workflow_name),
            None,
            json!({
                "WorkflowName": plan.workflow_name,
                "LifecycleEvent": plan.lifecycle_event,
                "CorrelationId": plan.correlation_id,
                "Actor": plan.request.actor,
                "Steps": plan.steps.len(),
                "OnFailureSteps": plan.on_failure_steps.len(),
            }),
        );

        let mut steps = Vec::with_capacity(plan.steps.len());
        for step in &plan.steps {
            let result = self.run_step(&ctx, &registry, step).await;
            let failed = result.is_failed();
            steps.push(result);
            if failed {
                break;
            }
        }
        let status = if steps.iter().any(StepResult::is_failed) {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };

        let on_failure = if status == RunStatus::Failed && !plan.on_failure_steps.is_empty() {
            self.run_on_failure(&ctx, &registry, plan).await
        } else {
            OnFailureResult::not_run()
        };

        match status {
            RunStatus::Completed => info!(workflow = %plan.workflow_name, "Run completed"),
            RunStatus::Failed => error!(workflow = %plan.workflow_name, "Run failed"),
        }
        ctx.emit(
            names::RUN_COMPLETED,
            format!("Run {:?}", status),
            None,
            json!({
                "Status": status,
                "Steps": steps.len(),
                "OnFailureStatus": on_failure.status,
            }),
        );

        Ok(ExecutionResult {
            status,
            correlation_id: plan.correlation_id.clone(),
            actor: plan.request.actor.clone(),
            steps,
            on_failure,
            events: ctx.events(),
            providers: providers.redacted_summary(),
        })
    }

    async fn run_on_failure(
        &self,
        ctx: &ExecutionContext,
        registry: &StepRegistry,
        plan: &Plan,
    ) -> OnFailureResult {
        warn!(steps = plan.on_failure_steps.len(), "Running on-failure steps");
        ctx.emit(
            names::ON_FAILURE_STARTED,
            "On-failure steps started",
            None,
            json!({ "Steps": plan.on_failure_steps.len() }),
        );

        let mut results = Vec::with_capacity(plan.on_failure_steps.len());
        for step in &plan.on_failure_steps {
            results.push(self.run_step(ctx, registry, step).await);
        }
        let status = if results.iter().any(StepResult::is_failed) {
            OnFailureStatus::PartiallyFailed
        } else {
            OnFailureStatus::Completed
        };

        ctx.emit(
            names::ON_FAILURE_COMPLETED,
            format!("On-failure steps {:?}", status),
            None,
            json!({ "Status": status, "Steps": results.len() }),
        );
        OnFailureResult {
            status,
            steps: results,
        }
    }

    async fn run_step(
        &self,
        ctx: &ExecutionContext,
        registry: &StepRegistry,
        step: &PlanStep,
    ) -> StepResult {
        if !step.is_applicable() {
            debug!(step = %step.name, "Step not applicable");
            ctx.emit(
                names::STEP_NOT_APPLICABLE,
                format!("Step not applicable: {}", step.name),
                Some(&step.name),
                json!({ "Index": step.index, "Type": step.step_type }),
            );
            return StepResult::not_applicable(step);
        }

        info!(step = %step.name, step_type = %step.step_type, "Step started");
        ctx.emit(
            names::STEP_STARTED,
            format!("Step started: {}", step.name),
            Some(&step.name),
            json!({ "Index": step.index, "Type": step.step_type }),
        );

        let Some(handler) = registry.get(&step.step_type) else {
            let err = IdcycleError::Dispatch {
                step_type: step.step_type.clone(),
            };
            return self.fail(ctx, step, err, 1);
        };

        let session = match self.session_for(ctx, handler.as_ref(), step) {
            Ok(session) => session,
            Err(e) => return self.fail(ctx, step, e, 1),
        };

        self.invoke_with_retry(ctx, handler.as_ref(), step, session)
            .await
    }

    /// Acquire the step's declared auth session, if the handler accepts one.
    fn session_for(
        &self,
        ctx: &ExecutionContext,
        handler: &dyn StepHandler,
        step: &PlanStep,
    ) -> Result<Option<SessionHandle>> {
        let Some(name) = step.auth_session_name() else {
            return Ok(None);
        };
        if !handler.supports_session() {
            debug!(step = %step.name, session = %name, "Handler takes no session; invoking without");
            return Ok(None);
        }
        ctx.acquire_auth_session(&step.name, name, step.auth_session_options())
            .map(Some)
    }

    async fn invoke_with_retry(
        &self,
        ctx: &ExecutionContext,
        handler: &dyn StepHandler,
        step: &PlanStep,
        session: Option<SessionHandle>,
    ) -> StepResult {
        let seed = retry_seed(ctx.correlation_id(), &step.step_type, &step.name, step.index);
        let mut backoff = self.retry.backoff(seed);
        let max_attempts = self.retry.max_attempts();
        let mut attempt = 1;

        loop {
            let input = StepInput::from_plan_step(step, session.clone());
            match handler.execute(input, ctx.step_context(step)).await {
                Ok(mut outcome) => {
                    outcome.output = outcome.output.map(|o| self.redactor.redact(&o));
                    info!(step = %step.name, changed = outcome.changed, attempt, "Step completed");
                    ctx.emit(
                        names::STEP_COMPLETED,
                        format!("Step completed: {}", step.name),
                        Some(&step.name),
                        json!({
                            "Index": step.index,
                            "Type": step.step_type,
                            "Changed": outcome.changed,
                            "Attempts": attempt,
                        }),
                    );
                    return StepResult::completed(step, outcome, attempt);
                }
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = backoff.next_delay();
                    warn!(
                        step = %step.name,
                        attempt,
                        max_attempts,
                        backoff_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying step"
                    );
                    ctx.emit(
                        names::STEP_RETRYING,
                        format!("Retrying step: {}", step.name),
                        Some(&step.name),
                        json!({
                            "Attempt": attempt,
                            "NextAttempt": attempt + 1,
                            "DelayMs": delay.as_millis() as u64,
                            "Error": e.to_string(),
                        }),
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return self.fail(ctx, step, e, attempt),
            }
        }
    }

    fn fail(
        &self,
        ctx: &ExecutionContext,
        step: &PlanStep,
        err: IdcycleError,
        attempts: u32,
    ) -> StepResult {
        error!(step = %step.name, step_type = %step.step_type, attempts, error = %err, "Step failed");
        ctx.emit(
            names::STEP_FAILED,
            format!("Step failed: {}", step.name),
            Some(&step.name),
            json!({
                "Index": step.index,
                "Type": step.step_type,
                "Attempts": attempts,
                "Error": { "Kind": err.kind(), "Message": err.to_string() },
            }),
        );
        StepResult::failed(step, &err, attempts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use idcycle_test_utils::{fixtures, ScriptedHandler};

    fn plan(steps: Vec<PlanStep>) -> Plan {
        Plan {
            workflow_name: "wf".into(),
            lifecycle_event: "Joiner".into(),
            correlation_id: fixtures::CORRELATION_ID.into(),
            request: fixtures::request("Joiner"),
            steps,
            on_failure_steps: vec![],
            created_utc: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn unknown_type_fails_only_that_step() {
        let executor = Executor::new(&EngineConfig::default()).with_registry(StepRegistry::new());
        let result = executor
            .execute(
                &plan(vec![fixtures::plan_step(0, "a", "Missing", json!({}))]),
                &ProviderRegistry::new(),
                None,
            )
            .await
            .unwrap();
        assert_eq!(result.status, RunStatus::Failed);
        let err = result.steps[0].error.as_ref().unwrap();
        assert_eq!(err.kind, "DispatchError");
        assert_eq!(result.steps[0].attempts, 1);
    }

    #[tokio::test]
    async fn handler_without_session_support_gets_none() {
        let handler = ScriptedHandler::ok("Plain");
        let mut registry = StepRegistry::new();
        registry.register(handler.clone());
        let executor = Executor::new(&EngineConfig::default()).with_registry(registry);
        let step = fixtures::plan_step(0, "a", "Plain", json!({ "AuthSessionName": "AD" }));
        // no acquirer configured, but the handler never asks for a session
        let result = executor
            .execute(&plan(vec![step]), &ProviderRegistry::new(), None)
            .await
            .unwrap();
        assert_eq!(result.status, RunStatus::Completed);
        assert!(handler.sessions()[0].is_none());
    }

    #[tokio::test]
    async fn output_is_redacted() {
        let handler = ScriptedHandler::new(
            "Emit",
            vec![idcycle_test_utils::Scripted::Ok(
                StepOutcome::changed().with_output(json!({ "User": "a", "InitialPassword": "x" })),
            )],
        );
        let mut registry = StepRegistry::new();
        registry.register(handler);
        let executor = Executor::new(&EngineConfig::default()).with_registry(registry);
        let result = executor
            .execute(
                &plan(vec![fixtures::plan_step(0, "a", "Emit", json!({}))]),
                &ProviderRegistry::new(),
                None,
            )
            .await
            .unwrap();
        let output = result.steps[0].output.as_ref().unwrap();
        assert_eq!(output["User"], json!("a"));
        assert_eq!(output["InitialPassword"], json!("[REDACTED]"));
    }
}
