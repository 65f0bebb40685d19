pub mod emit_event;
pub mod identity;

use serde::de::DeserializeOwned;
use serde_json::Value;

use idcycle_core::error::{IdcycleError, Result};
use idcycle_core::traits::StepInput;

/// Provider alias identity steps use when `With.Provider` is absent.
pub const DEFAULT_PROVIDER_ALIAS: &str = "Identity";

/// Deserialize a step's `With` record into its typed input.
pub(crate) fn parse_with<T: DeserializeOwned>(input: &StepInput) -> Result<T> {
    serde_json::from_value(Value::Object(input.with.clone())).map_err(|e| {
        IdcycleError::step(format!(
            "invalid With for step '{}' ({}): {}",
            input.name, input.step_type, e
        ))
    })
}
