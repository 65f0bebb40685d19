use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{json, Map, Value};

use crate::error::{IdcycleError, Result};
use crate::event::{names, EventRecorder};
use crate::security::assert_no_executable_content;
use crate::types::*;

/// Step handler: one dispatchable step `Type`.
pub trait StepHandler: Send + Sync + 'static {
    /// Dispatch key matched against `StepSpec.Type`.
    fn step_type(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// Whether the handler wants an auth session passed in `StepInput.session`.
    /// Handlers that return false are invoked without one even when the step
    /// declares `AuthSessionName`.
    fn supports_session(&self) -> bool {
        false
    }

    /// Capabilities this step type always needs, merged into every plan step of this type.
    fn required_capabilities(&self) -> Vec<String> {
        vec![]
    }

    /// Execute the step.
    fn execute(&self, input: StepInput, ctx: StepContext) -> BoxFuture<'_, Result<StepOutcome>>;
}

/// What a handler receives for one attempt.
#[derive(Debug, Clone)]
pub struct StepInput {
    pub index: usize,
    pub name: String,
    pub step_type: String,
    pub with: Map<String, Value>,
    pub session: Option<SessionHandle>,
}

impl StepInput {
    pub fn from_plan_step(step: &PlanStep, session: Option<SessionHandle>) -> Self {
        Self {
            index: step.index,
            name: step.name.clone(),
            step_type: step.step_type.clone(),
            with: step.with.clone(),
            session,
        }
    }

    /// Required string entry from `With`.
    pub fn require_str(&self, key: &str) -> Result<&str> {
        match self.with.get(key) {
            Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.as_str()),
            Some(_) => Err(IdcycleError::step(format!(
                "With.{} must be a non-empty string",
                key
            ))),
            None => Err(IdcycleError::step(format!("With.{} is required", key))),
        }
    }

    pub fn optional_str(&self, key: &str) -> Option<&str> {
        self.with.get(key).and_then(Value::as_str)
    }
}

/// Per-step view of the run handed to handlers. Cheap to clone.
#[derive(Clone)]
pub struct StepContext {
    pub correlation_id: String,
    pub actor: Option<String>,
    pub step_name: String,
    pub step_type: String,
    pub providers: Arc<ProviderRegistry>,
    events: EventRecorder,
}

impl StepContext {
    pub fn new(
        correlation_id: impl Into<String>,
        actor: Option<String>,
        step: &PlanStep,
        providers: Arc<ProviderRegistry>,
        events: EventRecorder,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            actor,
            step_name: step.name.clone(),
            step_type: step.step_type.clone(),
            providers,
            events,
        }
    }

    /// Emit a `Custom` event attributed to the current step. Lifecycle event
    /// names are reserved for the engine.
    pub fn emit(&self, message: impl Into<String>, data: Value) {
        self.events
            .emit(names::CUSTOM, message, Some(self.step_name.as_str()), data);
    }

    pub fn provider(&self, alias: &str) -> Result<Arc<dyn Provider>> {
        self.providers
            .get(alias)
            .ok_or_else(|| IdcycleError::Provider {
                provider: alias.to_string(),
                message: "no provider registered under this alias".into(),
            })
    }
}

impl std::fmt::Debug for StepContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepContext")
            .field("correlation_id", &self.correlation_id)
            .field("step_name", &self.step_name)
            .field("step_type", &self.step_type)
            .finish()
    }
}

/// Backend provider (directory, cloud identity, mailbox, ...).
///
/// Domain methods return whether backend state changed. A provider only
/// implements the operations matching the capabilities it advertises; the rest
/// report an unsupported-operation error.
pub trait Provider: Send + Sync + 'static {
    /// Provider implementation name, e.g. "InMemory".
    fn kind(&self) -> &str;

    /// Capability tags this provider advertises.
    fn capabilities(&self) -> Vec<String>;

    /// Declared configuration. Guarded for executable content, never exported.
    fn config(&self) -> Value {
        Value::Null
    }

    /// Provider-supplied step handlers; these override built-ins of the same type.
    fn step_handlers(&self) -> Vec<Arc<dyn StepHandler>> {
        vec![]
    }

    fn get_identity(
        &self,
        key: String,
        session: Option<SessionHandle>,
    ) -> BoxFuture<'_, Result<Option<Value>>> {
        let _ = (key, session);
        unsupported(self.kind(), "GetIdentity")
    }

    fn create_identity(
        &self,
        key: String,
        attributes: Map<String, Value>,
        session: Option<SessionHandle>,
    ) -> BoxFuture<'_, Result<bool>> {
        let _ = (key, attributes, session);
        unsupported(self.kind(), "CreateIdentity")
    }

    fn ensure_attribute(
        &self,
        key: String,
        name: String,
        value: Value,
        session: Option<SessionHandle>,
    ) -> BoxFuture<'_, Result<bool>> {
        let _ = (key, name, value, session);
        unsupported(self.kind(), "EnsureAttribute")
    }

    /// Grant (`present = true`) or revoke an entitlement.
    fn ensure_entitlement(
        &self,
        key: String,
        entitlement: String,
        present: bool,
        session: Option<SessionHandle>,
    ) -> BoxFuture<'_, Result<bool>> {
        let _ = (key, entitlement, present, session);
        unsupported(self.kind(), "EnsureEntitlement")
    }

    fn disable_identity(
        &self,
        key: String,
        session: Option<SessionHandle>,
    ) -> BoxFuture<'_, Result<bool>> {
        let _ = (key, session);
        unsupported(self.kind(), "DisableIdentity")
    }

    fn move_identity(
        &self,
        key: String,
        container: String,
        session: Option<SessionHandle>,
    ) -> BoxFuture<'_, Result<bool>> {
        let _ = (key, container, session);
        unsupported(self.kind(), "MoveIdentity")
    }

    fn delete_identity(
        &self,
        key: String,
        session: Option<SessionHandle>,
    ) -> BoxFuture<'_, Result<bool>> {
        let _ = (key, session);
        unsupported(self.kind(), "DeleteIdentity")
    }
}

fn unsupported<T: Send + 'static>(kind: &str, operation: &str) -> BoxFuture<'static, Result<T>> {
    let err = IdcycleError::Provider {
        provider: kind.to_string(),
        message: format!("{} is not supported", operation),
    };
    Box::pin(async move { Err(err) })
}

/// Resolves an auth session by routing name and options.
pub trait AuthSessionAcquirer: Send + Sync + 'static {
    fn acquire(&self, name: &str, options: Option<&Map<String, Value>>) -> Result<SessionHandle>;
}

/// Provider aliases plus the optional auth session acquirer.
///
/// Shared and read-only during a run; the engine only reads handler references
/// and capability declarations from it.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Arc<dyn Provider>>,
    auth_sessions: Option<Arc<dyn AuthSessionAcquirer>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under `alias`, replacing any previous one.
    pub fn register(&mut self, alias: impl Into<String>, provider: Arc<dyn Provider>) {
        self.providers.insert(alias.into(), provider);
    }

    pub fn with_provider(mut self, alias: impl Into<String>, provider: Arc<dyn Provider>) -> Self {
        self.register(alias, provider);
        self
    }

    pub fn set_auth_sessions(&mut self, acquirer: Arc<dyn AuthSessionAcquirer>) {
        self.auth_sessions = Some(acquirer);
    }

    pub fn with_auth_sessions(mut self, acquirer: Arc<dyn AuthSessionAcquirer>) -> Self {
        self.set_auth_sessions(acquirer);
        self
    }

    pub fn get(&self, alias: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(alias).cloned()
    }

    pub fn aliases(&self) -> Vec<&str> {
        self.providers.keys().map(String::as_str).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn auth_sessions(&self) -> Option<&Arc<dyn AuthSessionAcquirer>> {
        self.auth_sessions.as_ref()
    }

    /// Union of every provider's advertised capabilities.
    pub fn capabilities(&self) -> BTreeSet<String> {
        self.providers
            .values()
            .flat_map(|p| p.capabilities())
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect()
    }

    /// Provider-supplied handlers in alias order.
    pub fn step_handlers(&self) -> Vec<Arc<dyn StepHandler>> {
        self.providers
            .values()
            .flat_map(|p| p.step_handlers())
            .collect()
    }

    pub fn assert_no_executable_config(&self) -> Result<()> {
        for (alias, provider) in &self.providers {
            assert_no_executable_content(&provider.config(), &format!("Providers.{}", alias))?;
        }
        Ok(())
    }

    /// Allow-listed audit view: provider kind and capabilities only.
    pub fn redacted_summary(&self) -> Value {
        let providers: Map<String, Value> = self
            .providers
            .iter()
            .map(|(alias, provider)| {
                let caps: BTreeSet<String> = provider.capabilities().into_iter().collect();
                (
                    alias.clone(),
                    json!({ "Kind": provider.kind(), "Capabilities": caps }),
                )
            })
            .collect();
        json!({
            "Providers": providers,
            "AuthSessions": { "Configured": self.auth_sessions.is_some() },
        })
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("aliases", &self.aliases())
            .field("auth_sessions", &self.auth_sessions.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Directory {
        config: Value,
    }

    impl Provider for Directory {
        fn kind(&self) -> &str {
            "Directory"
        }

        fn capabilities(&self) -> Vec<String> {
            vec![" Identity.Read ".into(), "Identity.Create".into(), "".into()]
        }

        fn config(&self) -> Value {
            self.config.clone()
        }
    }

    struct Mailbox;

    impl Provider for Mailbox {
        fn kind(&self) -> &str {
            "Mailbox"
        }

        fn capabilities(&self) -> Vec<String> {
            vec!["Mailbox.Ensure".into(), "Identity.Read".into()]
        }
    }

    fn registry() -> ProviderRegistry {
        ProviderRegistry::new()
            .with_provider(
                "Identity",
                Arc::new(Directory {
                    config: json!({ "Host": "dc01", "Password": "p@ss" }),
                }),
            )
            .with_provider("Mail", Arc::new(Mailbox))
    }

    #[test]
    fn capabilities_are_unioned_and_trimmed() {
        let caps: Vec<String> = registry().capabilities().into_iter().collect();
        assert_eq!(
            caps,
            vec!["Identity.Create", "Identity.Read", "Mailbox.Ensure"]
        );
    }

    #[test]
    fn summary_never_contains_config() {
        let summary = registry().redacted_summary();
        let text = summary.to_string();
        assert!(!text.contains("p@ss"));
        assert!(!text.contains("dc01"));
        assert_eq!(summary["Providers"]["Identity"]["Kind"], json!("Directory"));
        assert_eq!(summary["AuthSessions"]["Configured"], json!(false));
    }

    #[test]
    fn executable_config_rejected() {
        let reg = ProviderRegistry::new().with_provider(
            "Identity",
            Arc::new(Directory {
                config: json!({ "Hooks": { "OnCreate": { "$script": "rm -rf /" } } }),
            }),
        );
        match reg.assert_no_executable_config() {
            Err(IdcycleError::SecurityViolation { path, .. }) => {
                assert!(path.starts_with("Providers.Identity.Hooks.OnCreate"));
            }
            other => panic!("expected security violation, got {:?}", other),
        }
        assert!(registry().assert_no_executable_config().is_ok());
    }

    #[tokio::test]
    async fn unimplemented_domain_methods_report_unsupported() {
        let mailbox = Mailbox;
        let err = mailbox
            .disable_identity("alice".into(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, IdcycleError::Provider { ref provider, .. } if provider == "Mailbox"));
        assert!(err.to_string().contains("DisableIdentity"));
    }
}
