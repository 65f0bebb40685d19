use std::sync::Arc;

use serde_json::{json, Map, Value};

use idcycle_auth::AuthSessionBroker;
use idcycle_core::config::EngineConfig;
use idcycle_core::traits::ProviderRegistry;
use idcycle_core::types::*;
use idcycle_engine::{Executor, PlanBuilder};
use idcycle_steps::{InMemoryIdentityProvider, StepRegistry};
use idcycle_test_utils::fixtures::{request, workflow};
use idcycle_test_utils::{ScriptedHandler, StaticProvider};

fn pattern(v: Value) -> Map<String, Value> {
    v.as_object().cloned().unwrap()
}

fn broker_with_admin_routes(duplicate: bool) -> AuthSessionBroker {
    let mut builder = AuthSessionBroker::builder()
        .route(
            pattern(json!({ "AuthSessionName": "AD", "Role": "Admin" })),
            AuthSessionDescriptor::new(SessionKind::Credential, SessionHandle::new("ad-admin")),
        )
        .default_session(AuthSessionDescriptor::new(
            SessionKind::Credential,
            SessionHandle::new("default"),
        ));
    if duplicate {
        builder = builder.route(
            pattern(json!({ "AuthSessionName": "AD", "Role": "Admin" })),
            AuthSessionDescriptor::new(SessionKind::Credential, SessionHandle::new("ad-admin-2")),
        );
    }
    builder.build().unwrap()
}

fn session_step() -> Value {
    json!({
        "Name": "Privileged",
        "Type": "NeedsSession",
        "With": { "AuthSessionName": "AD", "AuthSessionOptions": { "Role": "Admin" } }
    })
}

fn harness(handler: &ScriptedHandler) -> (PlanBuilder, Executor) {
    let mut registry = StepRegistry::with_builtins();
    registry.register(handler.clone());
    (
        PlanBuilder::new().with_registry(registry.clone()),
        Executor::new(&EngineConfig::default()).with_registry(registry),
    )
}

#[tokio::test]
async fn handler_receives_routed_session() {
    let handler = ScriptedHandler::ok("NeedsSession").with_session_support();
    let (builder, executor) = harness(&handler);
    let providers = ProviderRegistry::new().with_auth_sessions(Arc::new(broker_with_admin_routes(false)));

    let plan = builder
        .build(&workflow("Joiner", vec![session_step()], vec![]), &request("Joiner"), &providers)
        .unwrap();
    let result = executor.execute(&plan, &providers, None).await.unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    let sessions = handler.sessions();
    let session = sessions[0].as_ref().unwrap();
    assert_eq!(session.downcast_ref::<&str>(), Some(&"ad-admin"));
    assert_eq!(result.providers["AuthSessions"]["Configured"], json!(true));
}

#[tokio::test]
async fn ambiguous_routes_fail_the_step_not_pick_one() {
    let handler = ScriptedHandler::ok("NeedsSession").with_session_support();
    let (builder, executor) = harness(&handler);
    let providers = ProviderRegistry::new().with_auth_sessions(Arc::new(broker_with_admin_routes(true)));

    let plan = builder
        .build(&workflow("Joiner", vec![session_step()], vec![]), &request("Joiner"), &providers)
        .unwrap();
    let result = executor.execute(&plan, &providers, None).await.unwrap();

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(handler.calls(), 0);
    let error = result.steps[0].error.as_ref().unwrap();
    assert_eq!(error.kind, "SessionError");
    assert!(error.message.contains("Ambiguous"));
    assert_eq!(result.steps[0].attempts, 1);
}

#[tokio::test]
async fn registry_swapped_without_broker_fails_step_at_runtime() {
    let handler = ScriptedHandler::ok("NeedsSession").with_session_support();
    let (builder, executor) = harness(&handler);
    let with_broker =
        ProviderRegistry::new().with_auth_sessions(Arc::new(broker_with_admin_routes(false)));
    let plan = builder
        .build(&workflow("Joiner", vec![session_step()], vec![]), &request("Joiner"), &with_broker)
        .unwrap();

    let result = executor
        .execute(&plan, &ProviderRegistry::new(), None)
        .await
        .unwrap();
    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.steps[0].error.as_ref().unwrap().kind, "SessionError");
    assert_eq!(handler.calls(), 0);
}

#[tokio::test]
async fn provider_secrets_never_reach_the_result() {
    let handler = ScriptedHandler::ok("Plain");
    let (builder, executor) = harness(&handler);

    let mut providers = ProviderRegistry::new().with_provider(
        "Identity",
        Arc::new(
            StaticProvider::new("Directory", &["Identity.Read"]).with_config(json!({
                "Server": "ldaps://dc01.corp.example",
                "BindPassword": "Tr0ub4dor&3",
                "Options": { "Tenant": "contoso-prod" }
            })),
        ),
    );
    let plan = builder
        .build(
            &workflow("Joiner", vec![json!({ "Name": "p", "Type": "Plain" })], vec![]),
            &request("Joiner"),
            &providers,
        )
        .unwrap();

    // Mutate the registry between build and execute.
    providers.register(
        "Identity",
        Arc::new(
            StaticProvider::new("Directory", &["Identity.Read"]).with_config(json!({
                "Server": "ldaps://dc02.corp.example",
                "ClientSecret": "rotated-secret-value",
            })),
        ),
    );
    let result = executor.execute(&plan, &providers, None).await.unwrap();

    let serialized = serde_json::to_string(&result).unwrap();
    for secret in [
        "ldaps://dc01.corp.example",
        "ldaps://dc02.corp.example",
        "Tr0ub4dor&3",
        "contoso-prod",
        "rotated-secret-value",
    ] {
        assert!(!serialized.contains(secret), "result leaked {}", secret);
    }
    assert_eq!(
        result.providers["Providers"]["Identity"],
        json!({ "Kind": "Directory", "Capabilities": ["Identity.Read"] })
    );
}

#[tokio::test]
async fn joiner_against_in_memory_directory() {
    let directory = Arc::new(InMemoryIdentityProvider::new());
    let providers = ProviderRegistry::new().with_provider("Identity", directory.clone());
    let doc = workflow(
        "Joiner",
        vec![
            json!({ "Name": "Create account", "Type": "CreateIdentity",
                    "With": { "IdentityKey": "{{Request.IdentityKeys.UserName}}",
                              "Attributes": { "Department": "{{Request.DesiredState.Department}}" } } }),
            json!({ "Name": "Grant VPN", "Type": "EnsureEntitlement",
                    "With": { "IdentityKey": "{{Request.IdentityKeys.UserName}}", "Entitlement": "VPN-Users" } }),
            json!({ "Name": "Finance share", "Type": "EnsureEntitlement",
                    "Condition": { "Equals": { "Path": "Request.DesiredState.Department", "Value": "Finance" } },
                    "With": { "IdentityKey": "{{Request.IdentityKeys.UserName}}", "Entitlement": "Finance-Share" } }),
        ],
        vec![],
    );

    let plan = PlanBuilder::new()
        .build(&doc, &request("Joiner"), &providers)
        .unwrap();
    let executor = Executor::new(&EngineConfig::default());

    let first = executor.execute(&plan, &providers, None).await.unwrap();
    assert_eq!(first.status, RunStatus::Completed);
    assert!(first.steps[0].changed && first.steps[1].changed);
    assert_eq!(first.steps[2].status, StepStatus::NotApplicable);

    // Re-running the same plan is idempotent.
    let second = executor.execute(&plan, &providers, None).await.unwrap();
    assert_eq!(second.status, RunStatus::Completed);
    assert!(second.steps.iter().all(|s| !s.changed));

    let alice = directory.get("alice").await.unwrap();
    assert_eq!(alice.attributes["Department"], json!("Sales"));
    assert!(alice.entitlements.contains("VPN-Users"));
    assert!(!alice.entitlements.contains("Finance-Share"));
}
