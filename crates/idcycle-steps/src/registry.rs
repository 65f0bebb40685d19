use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Value};

use idcycle_core::traits::{ProviderRegistry, StepHandler};

/// Registry of dispatchable step types.
#[derive(Clone, Default)]
pub struct StepRegistry {
    handlers: BTreeMap<String, Arc<dyn StepHandler>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any handler with the same step type.
    pub fn register(&mut self, handler: impl StepHandler) {
        self.register_arc(Arc::new(handler));
    }

    pub fn register_arc(&mut self, handler: Arc<dyn StepHandler>) {
        let step_type = handler.step_type().to_string();
        self.handlers.insert(step_type, handler);
    }

    /// Unregister a handler by step type.
    pub fn unregister(&mut self, step_type: &str) -> bool {
        self.handlers.remove(step_type).is_some()
    }

    pub fn get(&self, step_type: &str) -> Option<Arc<dyn StepHandler>> {
        self.handlers.get(step_type).cloned()
    }

    /// Registered step types, sorted.
    pub fn list(&self) -> Vec<&str> {
        self.handlers.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Catalog entries for listing: type, description, capabilities, session support.
    pub fn catalog(&self) -> Vec<Value> {
        self.handlers
            .values()
            .map(|h| {
                json!({
                    "Type": h.step_type(),
                    "Description": h.description(),
                    "RequiresCapabilities": h.required_capabilities(),
                    "SupportsSession": h.supports_session(),
                })
            })
            .collect()
    }

    /// This registry with every provider-supplied handler layered on top.
    /// Provider handlers win over same-typed entries already present.
    pub fn merged_with(&self, providers: &ProviderRegistry) -> Self {
        let mut merged = self.clone();
        for handler in providers.step_handlers() {
            merged.register_arc(handler);
        }
        merged
    }

    /// Create a registry with all built-in steps registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();

        registry.register(crate::builtin::emit_event::EmitEventStep);

        // ── Identity lifecycle ─────────────────────────────────
        registry.register(crate::builtin::identity::CreateIdentityStep);
        registry.register(crate::builtin::identity::EnsureAttributeStep);
        registry.register(crate::builtin::identity::EnsureEntitlementStep);
        registry.register(crate::builtin::identity::DisableIdentityStep);
        registry.register(crate::builtin::identity::MoveIdentityStep);
        registry.register(crate::builtin::identity::DeleteIdentityStep);

        registry
    }
}

impl std::fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepRegistry")
            .field("types", &self.list())
            .finish()
    }
}
