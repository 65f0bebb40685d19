use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::info;

use idcycle_core::error::{IdcycleError, Result};
use idcycle_core::traits::{Provider, StepContext, StepHandler, StepInput};
use idcycle_core::types::StepOutcome;

use super::{parse_with, DEFAULT_PROVIDER_ALIAS};

/// Provider lookup shared by every identity step.
fn resolve_provider(
    ctx: &StepContext,
    alias: Option<&str>,
    identity_key: &str,
) -> Result<(String, Arc<dyn Provider>)> {
    if identity_key.trim().is_empty() {
        return Err(IdcycleError::step("With.IdentityKey must not be empty"));
    }
    let alias = alias.unwrap_or(DEFAULT_PROVIDER_ALIAS).to_string();
    let provider = ctx.provider(&alias)?;
    Ok((alias, provider))
}

fn outcome(changed: bool, output: Value) -> StepOutcome {
    StepOutcome {
        changed,
        output: Some(output),
    }
}

// ── CreateIdentity ────────────────────────────────────────────

pub struct CreateIdentityStep;

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreateIdentityInput {
    #[serde(default)]
    provider: Option<String>,
    identity_key: String,
    #[serde(default)]
    attributes: Map<String, Value>,
}

impl StepHandler for CreateIdentityStep {
    fn step_type(&self) -> &str {
        "CreateIdentity"
    }

    fn description(&self) -> &str {
        "Create the identity if it does not exist yet."
    }

    fn supports_session(&self) -> bool {
        true
    }

    fn required_capabilities(&self) -> Vec<String> {
        vec!["Identity.Create".into()]
    }

    fn execute(&self, input: StepInput, ctx: StepContext) -> BoxFuture<'_, Result<StepOutcome>> {
        Box::pin(async move {
            let p: CreateIdentityInput = parse_with(&input)?;
            let (alias, provider) = resolve_provider(&ctx, p.provider.as_deref(), &p.identity_key)?;
            let changed = provider
                .create_identity(p.identity_key.clone(), p.attributes, input.session)
                .await?;
            info!(provider = %alias, identity = %p.identity_key, changed, "CreateIdentity");
            Ok(outcome(
                changed,
                json!({ "Provider": alias, "IdentityKey": p.identity_key }),
            ))
        })
    }
}

// ── EnsureAttribute ───────────────────────────────────────────

pub struct EnsureAttributeStep;

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EnsureAttributeInput {
    #[serde(default)]
    provider: Option<String>,
    identity_key: String,
    name: String,
    #[serde(default)]
    value: Value,
}

impl StepHandler for EnsureAttributeStep {
    fn step_type(&self) -> &str {
        "EnsureAttribute"
    }

    fn description(&self) -> &str {
        "Set an identity attribute to the desired value."
    }

    fn supports_session(&self) -> bool {
        true
    }

    fn required_capabilities(&self) -> Vec<String> {
        vec!["Identity.Attribute.Ensure".into()]
    }

    fn execute(&self, input: StepInput, ctx: StepContext) -> BoxFuture<'_, Result<StepOutcome>> {
        Box::pin(async move {
            let p: EnsureAttributeInput = parse_with(&input)?;
            if p.name.trim().is_empty() {
                return Err(IdcycleError::step("With.Name must not be empty"));
            }
            let (alias, provider) = resolve_provider(&ctx, p.provider.as_deref(), &p.identity_key)?;
            let changed = provider
                .ensure_attribute(p.identity_key.clone(), p.name.clone(), p.value, input.session)
                .await?;
            info!(provider = %alias, identity = %p.identity_key, attribute = %p.name, changed, "EnsureAttribute");
            Ok(outcome(
                changed,
                json!({ "Provider": alias, "IdentityKey": p.identity_key, "Attribute": p.name }),
            ))
        })
    }
}

// ── EnsureEntitlement ─────────────────────────────────────────

pub struct EnsureEntitlementStep;

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EnsureEntitlementInput {
    #[serde(default)]
    provider: Option<String>,
    identity_key: String,
    entitlement: String,
    /// "Present" (default) or "Absent".
    #[serde(default)]
    state: Option<String>,
}

impl StepHandler for EnsureEntitlementStep {
    fn step_type(&self) -> &str {
        "EnsureEntitlement"
    }

    fn description(&self) -> &str {
        "Grant or revoke an entitlement (group, role, license)."
    }

    fn supports_session(&self) -> bool {
        true
    }

    fn required_capabilities(&self) -> Vec<String> {
        vec!["Entitlement.Ensure".into()]
    }

    fn execute(&self, input: StepInput, ctx: StepContext) -> BoxFuture<'_, Result<StepOutcome>> {
        Box::pin(async move {
            let p: EnsureEntitlementInput = parse_with(&input)?;
            let present = match p.state.as_deref().map(str::trim) {
                None => true,
                Some(s) if s.eq_ignore_ascii_case("present") => true,
                Some(s) if s.eq_ignore_ascii_case("absent") => false,
                Some(other) => {
                    return Err(IdcycleError::step(format!(
                        "With.State must be 'Present' or 'Absent', got '{}'",
                        other
                    )))
                }
            };
            let (alias, provider) = resolve_provider(&ctx, p.provider.as_deref(), &p.identity_key)?;
            let changed = provider
                .ensure_entitlement(
                    p.identity_key.clone(),
                    p.entitlement.clone(),
                    present,
                    input.session,
                )
                .await?;
            info!(provider = %alias, identity = %p.identity_key, entitlement = %p.entitlement, present, changed, "EnsureEntitlement");
            Ok(outcome(
                changed,
                json!({
                    "Provider": alias,
                    "IdentityKey": p.identity_key,
                    "Entitlement": p.entitlement,
                    "State": if present { "Present" } else { "Absent" },
                }),
            ))
        })
    }
}

// ── DisableIdentity ───────────────────────────────────────────

pub struct DisableIdentityStep;

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct IdentityOnlyInput {
    #[serde(default)]
    provider: Option<String>,
    identity_key: String,
}

impl StepHandler for DisableIdentityStep {
    fn step_type(&self) -> &str {
        "DisableIdentity"
    }

    fn description(&self) -> &str {
        "Disable the identity so it can no longer sign in."
    }

    fn supports_session(&self) -> bool {
        true
    }

    fn required_capabilities(&self) -> Vec<String> {
        vec!["Identity.Disable".into()]
    }

    fn execute(&self, input: StepInput, ctx: StepContext) -> BoxFuture<'_, Result<StepOutcome>> {
        Box::pin(async move {
            let p: IdentityOnlyInput = parse_with(&input)?;
            let (alias, provider) = resolve_provider(&ctx, p.provider.as_deref(), &p.identity_key)?;
            let changed = provider
                .disable_identity(p.identity_key.clone(), input.session)
                .await?;
            info!(provider = %alias, identity = %p.identity_key, changed, "DisableIdentity");
            Ok(outcome(
                changed,
                json!({ "Provider": alias, "IdentityKey": p.identity_key }),
            ))
        })
    }
}

// ── MoveIdentity ──────────────────────────────────────────────

pub struct MoveIdentityStep;

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct MoveIdentityInput {
    #[serde(default)]
    provider: Option<String>,
    identity_key: String,
    target_container: String,
}

impl StepHandler for MoveIdentityStep {
    fn step_type(&self) -> &str {
        "MoveIdentity"
    }

    fn description(&self) -> &str {
        "Move the identity to another container or organizational unit."
    }

    fn supports_session(&self) -> bool {
        true
    }

    fn required_capabilities(&self) -> Vec<String> {
        vec!["Identity.Move".into()]
    }

    fn execute(&self, input: StepInput, ctx: StepContext) -> BoxFuture<'_, Result<StepOutcome>> {
        Box::pin(async move {
            let p: MoveIdentityInput = parse_with(&input)?;
            if p.target_container.trim().is_empty() {
                return Err(IdcycleError::step("With.TargetContainer must not be empty"));
            }
            let (alias, provider) = resolve_provider(&ctx, p.provider.as_deref(), &p.identity_key)?;
            let changed = provider
                .move_identity(
                    p.identity_key.clone(),
                    p.target_container.clone(),
                    input.session,
                )
                .await?;
            info!(provider = %alias, identity = %p.identity_key, target = %p.target_container, changed, "MoveIdentity");
            Ok(outcome(
                changed,
                json!({
                    "Provider": alias,
                    "IdentityKey": p.identity_key,
                    "TargetContainer": p.target_container,
                }),
            ))
        })
    }
}

// ── DeleteIdentity ────────────────────────────────────────────

pub struct DeleteIdentityStep;

impl StepHandler for DeleteIdentityStep {
    fn step_type(&self) -> &str {
        "DeleteIdentity"
    }

    fn description(&self) -> &str {
        "Delete the identity. Succeeds unchanged when it is already gone."
    }

    fn supports_session(&self) -> bool {
        true
    }

    fn required_capabilities(&self) -> Vec<String> {
        vec!["Identity.Delete".into()]
    }

    fn execute(&self, input: StepInput, ctx: StepContext) -> BoxFuture<'_, Result<StepOutcome>> {
        Box::pin(async move {
            let p: IdentityOnlyInput = parse_with(&input)?;
            let (alias, provider) = resolve_provider(&ctx, p.provider.as_deref(), &p.identity_key)?;
            let changed = provider
                .delete_identity(p.identity_key.clone(), input.session)
                .await?;
            info!(provider = %alias, identity = %p.identity_key, changed, "DeleteIdentity");
            Ok(outcome(
                changed,
                json!({ "Provider": alias, "IdentityKey": p.identity_key }),
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::InMemoryIdentityProvider;
    use idcycle_core::traits::ProviderRegistry;
    use idcycle_test_utils::fixtures;

    fn providers(directory: Arc<InMemoryIdentityProvider>) -> ProviderRegistry {
        ProviderRegistry::new().with_provider(DEFAULT_PROVIDER_ALIAS, directory)
    }

    async fn run(
        handler: &dyn StepHandler,
        providers: &ProviderRegistry,
        with: Value,
    ) -> Result<StepOutcome> {
        let (ctx, _) = fixtures::step_context("step", handler.step_type(), providers.clone());
        let input = fixtures::step_input("step", handler.step_type(), with);
        handler.execute(input, ctx).await
    }

    #[tokio::test]
    async fn create_then_create_again_is_unchanged() {
        let directory = Arc::new(InMemoryIdentityProvider::new());
        let providers = providers(directory.clone());
        let with = json!({ "IdentityKey": "alice", "Attributes": { "Department": "Sales" } });

        let first = run(&CreateIdentityStep, &providers, with.clone()).await.unwrap();
        assert!(first.changed);
        assert_eq!(first.output.unwrap()["Provider"], json!("Identity"));

        let second = run(&CreateIdentityStep, &providers, with).await.unwrap();
        assert!(!second.changed);

        let record = directory.get("alice").await.unwrap();
        assert_eq!(record.attributes["Department"], json!("Sales"));
        assert!(record.enabled);
    }

    #[tokio::test]
    async fn ensure_attribute_reports_change_once() {
        let directory = Arc::new(InMemoryIdentityProvider::new());
        directory.insert("bob", Default::default()).await;
        let providers = providers(directory.clone());
        let with = json!({ "IdentityKey": "bob", "Name": "Title", "Value": "Engineer" });

        assert!(run(&EnsureAttributeStep, &providers, with.clone()).await.unwrap().changed);
        assert!(!run(&EnsureAttributeStep, &providers, with).await.unwrap().changed);
    }

    #[tokio::test]
    async fn entitlement_grant_and_revoke() {
        let directory = Arc::new(InMemoryIdentityProvider::new());
        directory.insert("carol", Default::default()).await;
        let providers = providers(directory.clone());

        let grant = json!({ "IdentityKey": "carol", "Entitlement": "VPN-Users" });
        assert!(run(&EnsureEntitlementStep, &providers, grant.clone()).await.unwrap().changed);
        assert!(!run(&EnsureEntitlementStep, &providers, grant).await.unwrap().changed);
        assert!(directory.get("carol").await.unwrap().entitlements.contains("VPN-Users"));

        let revoke = json!({ "IdentityKey": "carol", "Entitlement": "VPN-Users", "State": "absent" });
        assert!(run(&EnsureEntitlementStep, &providers, revoke).await.unwrap().changed);

        let bad = json!({ "IdentityKey": "carol", "Entitlement": "VPN-Users", "State": "Maybe" });
        assert!(run(&EnsureEntitlementStep, &providers, bad).await.is_err());
    }

    #[tokio::test]
    async fn leaver_sequence() {
        let directory = Arc::new(InMemoryIdentityProvider::new());
        directory.insert("dave", Default::default()).await;
        let providers = providers(directory.clone());

        let key = json!({ "IdentityKey": "dave" });
        assert!(run(&DisableIdentityStep, &providers, key.clone()).await.unwrap().changed);
        assert!(!run(&DisableIdentityStep, &providers, key.clone()).await.unwrap().changed);

        let mv = json!({ "IdentityKey": "dave", "TargetContainer": "OU=Leavers" });
        assert!(run(&MoveIdentityStep, &providers, mv).await.unwrap().changed);
        assert_eq!(
            directory.get("dave").await.unwrap().container.as_deref(),
            Some("OU=Leavers")
        );

        assert!(run(&DeleteIdentityStep, &providers, key.clone()).await.unwrap().changed);
        assert!(!run(&DeleteIdentityStep, &providers, key).await.unwrap().changed);
        assert!(directory.get("dave").await.is_none());
    }

    #[tokio::test]
    async fn unknown_provider_alias_fails() {
        let providers = providers(Arc::new(InMemoryIdentityProvider::new()));
        let with = json!({ "Provider": "Graph", "IdentityKey": "erin" });
        let err = run(&DisableIdentityStep, &providers, with).await.unwrap_err();
        assert!(matches!(err, IdcycleError::Provider { ref provider, .. } if provider == "Graph"));
    }

    #[tokio::test]
    async fn missing_identity_is_provider_error() {
        let providers = providers(Arc::new(InMemoryIdentityProvider::new()));
        let with = json!({ "IdentityKey": "ghost" });
        let err = run(&DisableIdentityStep, &providers, with).await.unwrap_err();
        assert!(err.to_string().contains("ghost"));
        assert!(!err.is_transient());
    }
}
