use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::Value;

use idcycle_core::error::Result;
use idcycle_core::traits::{StepContext, StepHandler, StepInput};
use idcycle_core::types::StepOutcome;

use super::parse_with;

/// Emits a `Custom` event into the run's event stream. Never changes backend state.
pub struct EmitEventStep;

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EmitEventInput {
    message: String,
    #[serde(default)]
    data: Value,
}

impl StepHandler for EmitEventStep {
    fn step_type(&self) -> &str {
        "EmitEvent"
    }

    fn description(&self) -> &str {
        "Emit a custom event with a message and optional data."
    }

    fn execute(&self, input: StepInput, ctx: StepContext) -> BoxFuture<'_, Result<StepOutcome>> {
        Box::pin(async move {
            let p: EmitEventInput = parse_with(&input)?;
            ctx.emit(p.message, p.data);
            Ok(StepOutcome::unchanged())
        })
    }
}
