use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use idcycle_auth::AuthSessionBroker;
use idcycle_core::config::EngineConfig;
use idcycle_core::event::{names, EventBus, EventSink};
use idcycle_core::redact::Redactor;
use idcycle_core::traits::ProviderRegistry;
use idcycle_core::types::{LifecycleRequest, PlanStepStatus, RunStatus, StepStatus};
use idcycle_engine::plan::{export_plan, read_document};
use idcycle_engine::{Executor, PlanBuilder, RunLogger, WorkflowFile};
use idcycle_steps::InMemoryIdentityProvider;

fn demo(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("demos").join(name)
}

fn demo_request(name: &str) -> LifecycleRequest {
    serde_json::from_value(read_document(&demo(name)).expect("read request")).expect("parse request")
}

fn demo_providers(directory: Arc<InMemoryIdentityProvider>) -> ProviderRegistry {
    let config = EngineConfig::load(&demo("idcycle.toml")).expect("demo config");
    let broker = AuthSessionBroker::from_config(config.auth.as_ref().expect("auth")).expect("broker");
    ProviderRegistry::new()
        .with_provider("Identity", directory)
        .with_auth_sessions(Arc::new(broker))
}

#[tokio::test]
async fn joiner_demo_provisions_finance_hire() {
    let directory = Arc::new(InMemoryIdentityProvider::new());
    let providers = demo_providers(directory.clone());

    let plan = PlanBuilder::new()
        .build(
            &WorkflowFile::new(demo("joiner.json")),
            &demo_request("joiner-request.json"),
            &providers,
        )
        .expect("plan");
    assert_eq!(plan.correlation_id, "demo-joiner-0001");
    assert!(plan.steps.iter().all(|s| s.status == PlanStepStatus::Planned));

    let export = export_plan(&plan, &Redactor::default()).expect("export");
    assert!(!export.contains("Welcome-2026!"));

    let result = Executor::new(&EngineConfig::default())
        .execute(&plan, &providers, None)
        .await
        .expect("execute");
    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.actor.as_deref(), Some("hr-sync"));

    let jdoe = directory.get("jdoe").await.expect("jdoe created");
    assert_eq!(jdoe.attributes["Department"], json!("Finance"));
    assert_eq!(jdoe.attributes["Title"], json!("Analyst"));
    assert_eq!(jdoe.attributes["Mail"], json!("jdoe@example.com"));
    assert!(jdoe.entitlements.contains("VPN-Users"));
    assert!(jdoe.entitlements.contains("Finance-Share"));

    let custom: Vec<&Value> = result
        .events
        .iter()
        .filter(|e| e.name == names::CUSTOM)
        .map(|e| &e.data)
        .collect();
    assert_eq!(custom, vec![&json!({ "Department": "Finance" })]);
}

#[tokio::test]
async fn leaver_demo_parks_account_and_writes_run_log() {
    let seed = read_document(&demo("identities.json")).expect("seed");
    let directory = Arc::new(InMemoryIdentityProvider::from_seed(&seed).expect("seeded"));
    let providers = demo_providers(directory.clone());

    let plan = PlanBuilder::new()
        .build(
            &WorkflowFile::new(demo("leaver.toml")),
            &demo_request("leaver-request.json"),
            &providers,
        )
        .expect("plan");
    assert_eq!(plan.steps[3].status, PlanStepStatus::NotApplicable);

    let dir = tempfile::tempdir().expect("tempdir");
    let log_path = dir.path().join("events.jsonl");
    let bus = Arc::new(EventBus::default());
    let log_task = RunLogger::new(log_path.clone(), 3).spawn(
        &bus,
        plan.correlation_id.clone(),
        CancellationToken::new(),
    );

    let sink: Arc<dyn EventSink> = bus.clone();
    let result = Executor::new(&EngineConfig::default())
        .execute(&plan, &providers, Some(sink))
        .await
        .expect("execute");
    log_task.await.expect("log task");

    assert_eq!(result.status, RunStatus::Completed);
    let statuses: Vec<StepStatus> = result.steps.iter().map(|s| s.status).collect();
    assert_eq!(
        statuses,
        vec![
            StepStatus::Completed,
            StepStatus::Completed,
            StepStatus::Completed,
            StepStatus::NotApplicable,
        ]
    );

    let bsmith = directory.get("bsmith").await.expect("still present");
    assert!(!bsmith.enabled);
    assert!(!bsmith.entitlements.contains("VPN-Users"));
    assert!(bsmith.entitlements.contains("Sales-Share"));
    assert_eq!(bsmith.container.as_deref(), Some("OU=Leavers,DC=example,DC=com"));

    let lines: Vec<Value> = std::fs::read_to_string(&log_path)
        .expect("log written")
        .lines()
        .map(|l| serde_json::from_str(l).expect("json line"))
        .collect();
    assert_eq!(lines.len(), result.events.len());
    assert_eq!(lines.first().expect("first")["event_type"], json!("RunStarted"));
    assert_eq!(lines.last().expect("last")["event_type"], json!("RunCompleted"));
}

#[test]
fn lifecycle_event_mismatch_is_rejected() {
    let providers = demo_providers(Arc::new(InMemoryIdentityProvider::new()));
    let err = PlanBuilder::new()
        .build(
            &WorkflowFile::new(demo("leaver.toml")),
            &demo_request("joiner-request.json"),
            &providers,
        )
        .unwrap_err();
    assert_eq!(err.kind(), "ValidationError");
}
