use std::sync::Arc;

use serde_json::{json, Map, Value};

use idcycle_core::event::EventRecorder;
use idcycle_core::redact::Redactor;
use idcycle_core::traits::{ProviderRegistry, StepContext, StepInput};
use idcycle_core::types::{LifecycleRequest, PlanStep, PlanStepStatus};

pub const CORRELATION_ID: &str = "corr-0001";

/// Joiner/Mover/Leaver request with a fixed correlation id.
pub fn request(lifecycle_event: &str) -> LifecycleRequest {
    LifecycleRequest::new(lifecycle_event)
        .with_correlation_id(CORRELATION_ID)
        .with_actor("tests")
        .with_identity_key("UserName", "alice")
        .with_desired("Department", "Sales")
}

/// A step document with an empty `With`.
pub fn step(name: &str, step_type: &str) -> Value {
    json!({ "Name": name, "Type": step_type })
}

pub fn workflow(lifecycle_event: &str, steps: Vec<Value>, on_failure: Vec<Value>) -> Value {
    json!({
        "Name": format!("{} workflow", lifecycle_event),
        "LifecycleEvent": lifecycle_event,
        "Steps": steps,
        "OnFailureSteps": on_failure,
    })
}

pub fn plan_step(index: usize, name: &str, step_type: &str, with: Value) -> PlanStep {
    PlanStep {
        index,
        name: name.to_string(),
        step_type: step_type.to_string(),
        description: None,
        condition: None,
        with: as_map(with),
        requires_capabilities: vec![],
        status: PlanStepStatus::Planned,
    }
}

pub fn step_input(name: &str, step_type: &str, with: Value) -> StepInput {
    StepInput::from_plan_step(&plan_step(0, name, step_type, with), None)
}

/// Handler context plus the recorder it emits into.
pub fn step_context(
    name: &str,
    step_type: &str,
    providers: ProviderRegistry,
) -> (StepContext, EventRecorder) {
    let recorder = EventRecorder::new(None, Arc::new(Redactor::default()));
    let step = plan_step(0, name, step_type, Value::Null);
    let ctx = StepContext::new(
        CORRELATION_ID,
        Some("tests".into()),
        &step,
        Arc::new(providers),
        recorder.clone(),
    );
    (ctx, recorder)
}

fn as_map(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}
