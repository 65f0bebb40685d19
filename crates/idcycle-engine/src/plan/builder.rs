use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::Utc;
use regex::Regex;
use serde_json::{json, Value};
use tracing::{debug, info};

use idcycle_core::condition::Condition;
use idcycle_core::error::{IdcycleError, Result, SessionError};
use idcycle_core::security::assert_no_executable_content;
use idcycle_core::traits::ProviderRegistry;
use idcycle_core::types::*;
use idcycle_steps::StepRegistry;

use super::source::WorkflowSource;
use super::template::resolve_templates;

/// Capability tags are dot-separated alphanumeric segments, e.g. `Identity.Attribute.Ensure`.
pub const CAPABILITY_PATTERN: &str = r"^[A-Za-z][A-Za-z0-9]*(\.[A-Za-z0-9]+)*$";

/// Validates a workflow against a request and normalizes it into a [`Plan`].
///
/// Building is pure: only capability declarations and handler metadata are
/// consulted, never live provider state.
pub struct PlanBuilder {
    registry: StepRegistry,
}

impl Default for PlanBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PlanBuilder {
    pub fn new() -> Self {
        Self {
            registry: StepRegistry::with_builtins(),
        }
    }

    /// Registry whose handlers contribute their declared capabilities.
    pub fn with_registry(mut self, registry: StepRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn build<S: WorkflowSource + ?Sized>(
        &self,
        source: &S,
        request: &LifecycleRequest,
        providers: &ProviderRegistry,
    ) -> Result<Plan> {
        let raw = source.load()?;
        assert_no_executable_content(&raw, "Workflow")?;

        let workflow: WorkflowDefinition = serde_json::from_value(raw).map_err(|e| {
            IdcycleError::validation(format!("{}: {}", source.describe(), e))
        })?;
        validate_workflow(&workflow)?;

        let request = request.snapshot()?;
        if !workflow
            .lifecycle_event
            .trim()
            .eq_ignore_ascii_case(&request.lifecycle_event)
        {
            return Err(IdcycleError::validation(format!(
                "workflow '{}' handles LifecycleEvent '{}' but the request is '{}'",
                workflow.name, workflow.lifecycle_event, request.lifecycle_event
            )));
        }
        let correlation_id = request.correlation_id.clone().unwrap_or_default();

        let context = json!({
            "Plan": {
                "WorkflowName": workflow.name,
                "LifecycleEvent": request.lifecycle_event,
                "CorrelationId": correlation_id,
            },
            "Request": serde_json::to_value(&request)?,
            "Workflow": {
                "Name": workflow.name,
                "LifecycleEvent": workflow.lifecycle_event,
                "Description": workflow.description,
            },
        });

        let registry = self.registry.merged_with(providers);
        let steps = self.normalize(&workflow.steps, "Steps", &context, &registry)?;
        let on_failure_steps =
            self.normalize(&workflow.on_failure_steps, "OnFailureSteps", &context, &registry)?;

        check_capabilities(&steps, &on_failure_steps, providers)?;
        check_sessions(&steps, &on_failure_steps, providers)?;

        let plan = Plan {
            workflow_name: workflow.name.trim().to_string(),
            lifecycle_event: request.lifecycle_event.clone(),
            correlation_id,
            request,
            steps,
            on_failure_steps,
            created_utc: Utc::now(),
        };
        // Templates may have pulled request data into step configuration.
        assert_no_executable_content(&serde_json::to_value(&plan)?, "Plan")?;

        info!(
            workflow = %plan.workflow_name,
            correlation_id = %plan.correlation_id,
            steps = plan.steps.len(),
            on_failure_steps = plan.on_failure_steps.len(),
            not_applicable = plan.steps.iter().filter(|s| !s.is_applicable()).count(),
            "Plan built"
        );
        Ok(plan)
    }

    fn normalize(
        &self,
        specs: &[StepSpec],
        list: &str,
        context: &Value,
        registry: &StepRegistry,
    ) -> Result<Vec<PlanStep>> {
        specs
            .iter()
            .enumerate()
            .map(|(index, spec)| {
                let at = format!("{}[{}]", list, index);
                let condition = spec
                    .condition
                    .as_ref()
                    .map(|c| Condition::parse(c, &format!("{}.Condition", at)))
                    .transpose()?;
                let status = match &condition {
                    Some(c) if !c.evaluate(context) => PlanStepStatus::NotApplicable,
                    _ => PlanStepStatus::Planned,
                };

                // A false condition may guard placeholders that do not resolve,
                // so skipped steps keep `With` as written.
                let with = match status {
                    PlanStepStatus::Planned => {
                        resolve_templates(&spec.with, context, &format!("{}.With", at))?
                    }
                    PlanStepStatus::NotApplicable => spec.with.clone(),
                };
                validate_session_keys(&with, &at)?;

                let mut capabilities: BTreeSet<String> = spec
                    .requires_capabilities
                    .iter()
                    .map(|c| c.trim().to_string())
                    .collect();
                if let Some(handler) = registry.get(spec.step_type.trim()) {
                    capabilities.extend(handler.required_capabilities());
                }

                if status == PlanStepStatus::NotApplicable {
                    debug!(step = %spec.name, "Condition false; step not applicable");
                }
                Ok(PlanStep {
                    index,
                    name: spec.name.trim().to_string(),
                    step_type: spec.step_type.trim().to_string(),
                    description: spec.description.clone(),
                    condition,
                    with,
                    requires_capabilities: capabilities.into_iter().collect(),
                    status,
                })
            })
            .collect()
    }
}

fn validate_workflow(workflow: &WorkflowDefinition) -> Result<()> {
    if workflow.name.trim().is_empty() {
        return Err(IdcycleError::validation("workflow Name must not be empty"));
    }
    if workflow.lifecycle_event.trim().is_empty() {
        return Err(IdcycleError::validation(
            "workflow LifecycleEvent must not be empty",
        ));
    }
    if workflow.steps.is_empty() {
        return Err(IdcycleError::validation(
            "workflow must declare at least one step",
        ));
    }

    let capability_re = Regex::new(CAPABILITY_PATTERN)
        .map_err(|e| IdcycleError::validation(format!("capability pattern: {}", e)))?;
    for (list, specs) in [
        ("Steps", &workflow.steps),
        ("OnFailureSteps", &workflow.on_failure_steps),
    ] {
        let mut seen = HashSet::new();
        for (i, spec) in specs.iter().enumerate() {
            let at = format!("{}[{}]", list, i);
            if spec.name.trim().is_empty() {
                return Err(IdcycleError::validation(format!("{}.Name must not be empty", at)));
            }
            if spec.step_type.trim().is_empty() {
                return Err(IdcycleError::validation(format!("{}.Type must not be empty", at)));
            }
            if !seen.insert(spec.name.trim()) {
                return Err(IdcycleError::validation(format!(
                    "{}: duplicate step name '{}'",
                    at, spec.name
                )));
            }
            for cap in &spec.requires_capabilities {
                if !capability_re.is_match(cap.trim()) {
                    return Err(IdcycleError::validation(format!(
                        "{}.RequiresCapabilities: invalid capability '{}'",
                        at, cap
                    )));
                }
            }
        }
    }
    Ok(())
}

fn validate_session_keys(with: &serde_json::Map<String, Value>, at: &str) -> Result<()> {
    if let Some(name) = with.get(AUTH_SESSION_NAME_KEY) {
        if !name.is_string() {
            return Err(IdcycleError::validation(format!(
                "{}.With.{} must be a string",
                at, AUTH_SESSION_NAME_KEY
            )));
        }
    }
    if let Some(options) = with.get(AUTH_SESSION_OPTIONS_KEY) {
        if !options.is_object() {
            return Err(IdcycleError::validation(format!(
                "{}.With.{} must be an object",
                at, AUTH_SESSION_OPTIONS_KEY
            )));
        }
        if !with.contains_key(AUTH_SESSION_NAME_KEY) {
            return Err(IdcycleError::validation(format!(
                "{}.With.{} requires {}",
                at, AUTH_SESSION_OPTIONS_KEY, AUTH_SESSION_NAME_KEY
            )));
        }
    }
    Ok(())
}

/// Every required capability across main and on-failure steps must be advertised.
fn check_capabilities(
    steps: &[PlanStep],
    on_failure_steps: &[PlanStep],
    providers: &ProviderRegistry,
) -> Result<()> {
    let available = providers.capabilities();
    let mut missing: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for step in steps.iter().chain(on_failure_steps) {
        for cap in &step.requires_capabilities {
            if !available.contains(cap) {
                missing.entry(cap.clone()).or_default().push(step.name.clone());
            }
        }
    }
    if missing.is_empty() {
        return Ok(());
    }

    let mut affected_steps: Vec<String> = Vec::new();
    for step in steps.iter().chain(on_failure_steps) {
        if step.requires_capabilities.iter().any(|c| missing.contains_key(c))
            && !affected_steps.contains(&step.name)
        {
            affected_steps.push(step.name.clone());
        }
    }
    Err(IdcycleError::Capability {
        missing: missing.into_keys().collect(),
        affected_steps,
        available: available.into_iter().collect(),
    })
}

/// A step that names an auth session needs an acquirer configured up front.
fn check_sessions(
    steps: &[PlanStep],
    on_failure_steps: &[PlanStep],
    providers: &ProviderRegistry,
) -> Result<()> {
    if providers.auth_sessions().is_some() {
        return Ok(());
    }
    for step in steps.iter().chain(on_failure_steps) {
        if let Some(name) = step.auth_session_name() {
            return Err(SessionError::NotConfigured {
                step: step.name.clone(),
                name: name.to_string(),
            }
            .into());
        }
    }
    Ok(())
}
