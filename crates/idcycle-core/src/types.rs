use std::any::Any;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::condition::Condition;
use crate::error::{IdcycleError, Result, SessionError};
use crate::event::Event;

/// Reserved `With` key naming the auth session a step wants.
pub const AUTH_SESSION_NAME_KEY: &str = "AuthSessionName";
/// Reserved `With` key carrying routing options for the auth session.
pub const AUTH_SESSION_OPTIONS_KEY: &str = "AuthSessionOptions";

/// A declarative workflow document after strict parsing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct WorkflowDefinition {
    pub name: String,
    pub lifecycle_event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub steps: Vec<StepSpec>,
    #[serde(default)]
    pub on_failure_steps: Vec<StepSpec>,
}

/// One declared step as written in the workflow document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct StepSpec {
    pub name: String,
    #[serde(rename = "Type")]
    pub step_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Raw condition document; validated during plan normalization.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Value>,
    #[serde(default)]
    pub with: Map<String, Value>,
    #[serde(default)]
    pub requires_capabilities: Vec<String>,
}

/// The caller's lifecycle request. Data only; the plan keeps its own copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct LifecycleRequest {
    pub lifecycle_event: String,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub actor: Option<String>,
    #[serde(default)]
    pub identity_keys: Map<String, Value>,
    #[serde(default)]
    pub desired_state: Map<String, Value>,
    #[serde(default)]
    pub changes: Map<String, Value>,
}

impl LifecycleRequest {
    pub fn new(lifecycle_event: impl Into<String>) -> Self {
        Self {
            lifecycle_event: lifecycle_event.into(),
            correlation_id: None,
            actor: None,
            identity_keys: Map::new(),
            desired_state: Map::new(),
            changes: Map::new(),
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn with_identity_key(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.identity_keys.insert(key.into(), value.into());
        self
    }

    pub fn with_desired(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.desired_state.insert(key.into(), value.into());
        self
    }

    pub fn with_change(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.changes.insert(key.into(), value.into());
        self
    }

    /// Validate and produce the snapshot stored on a plan.
    ///
    /// A missing correlation id is generated here, once, so every consumer of the
    /// plan sees the same run identifier.
    pub fn snapshot(&self) -> Result<Self> {
        if self.lifecycle_event.trim().is_empty() {
            return Err(IdcycleError::validation(
                "request LifecycleEvent must not be empty",
            ));
        }
        let mut snapshot = self.clone();
        snapshot.lifecycle_event = snapshot.lifecycle_event.trim().to_string();
        match snapshot.correlation_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => snapshot.correlation_id = Some(id.to_string()),
            _ => snapshot.correlation_id = Some(Uuid::new_v4().to_string()),
        }
        Ok(snapshot)
    }
}

/// Plan-time status of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanStepStatus {
    Planned,
    NotApplicable,
}

/// A normalized step inside a plan.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PlanStep {
    pub index: usize,
    pub name: String,
    #[serde(rename = "Type")]
    pub step_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
    pub with: Map<String, Value>,
    pub requires_capabilities: Vec<String>,
    pub status: PlanStepStatus,
}

impl PlanStep {
    pub fn is_applicable(&self) -> bool {
        self.status == PlanStepStatus::Planned
    }

    /// The auth session name this step declares in `With`, if any.
    pub fn auth_session_name(&self) -> Option<&str> {
        self.with.get(AUTH_SESSION_NAME_KEY).and_then(Value::as_str)
    }

    pub fn auth_session_options(&self) -> Option<&Map<String, Value>> {
        self.with
            .get(AUTH_SESSION_OPTIONS_KEY)
            .and_then(Value::as_object)
    }
}

/// Immutable execution plan: the only contract between planning and execution.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Plan {
    pub workflow_name: String,
    pub lifecycle_event: String,
    pub correlation_id: String,
    pub request: LifecycleRequest,
    pub steps: Vec<PlanStep>,
    pub on_failure_steps: Vec<PlanStep>,
    pub created_utc: DateTime<Utc>,
}

/// Terminal status of a dispatched (or skipped) step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    Completed,
    Failed,
    NotApplicable,
}

/// Structured failure detail captured on a failed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StepErrorInfo {
    pub kind: String,
    pub message: String,
}

impl From<&IdcycleError> for StepErrorInfo {
    fn from(err: &IdcycleError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StepResult {
    pub name: String,
    #[serde(rename = "Type")]
    pub step_type: String,
    pub index: usize,
    pub status: StepStatus,
    pub changed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StepErrorInfo>,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
}

impl StepResult {
    pub fn not_applicable(step: &PlanStep) -> Self {
        Self {
            name: step.name.clone(),
            step_type: step.step_type.clone(),
            index: step.index,
            status: StepStatus::NotApplicable,
            changed: false,
            error: None,
            attempts: 0,
            output: None,
        }
    }

    pub fn failed(step: &PlanStep, err: &IdcycleError, attempts: u32) -> Self {
        Self {
            name: step.name.clone(),
            step_type: step.step_type.clone(),
            index: step.index,
            status: StepStatus::Failed,
            changed: false,
            error: Some(err.into()),
            attempts,
            output: None,
        }
    }

    pub fn completed(step: &PlanStep, outcome: StepOutcome, attempts: u32) -> Self {
        Self {
            name: step.name.clone(),
            step_type: step.step_type.clone(),
            index: step.index,
            status: StepStatus::Completed,
            changed: outcome.changed,
            error: None,
            attempts,
            output: outcome.output,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == StepStatus::Failed
    }
}

/// What a handler reports back. `StepOutcome::default()` is an implicit,
/// unchanged completion.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutcome {
    pub changed: bool,
    pub output: Option<Value>,
}

impl StepOutcome {
    pub fn changed() -> Self {
        Self {
            changed: true,
            output: None,
        }
    }

    pub fn unchanged() -> Self {
        Self::default()
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OnFailureStatus {
    NotRun,
    Completed,
    PartiallyFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OnFailureResult {
    pub status: OnFailureStatus,
    pub steps: Vec<StepResult>,
}

impl OnFailureResult {
    pub fn not_run() -> Self {
        Self {
            status: OnFailureStatus::NotRun,
            steps: vec![],
        }
    }
}

/// Serializable, redacted outcome of one `execute` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExecutionResult {
    pub status: RunStatus,
    pub correlation_id: String,
    pub actor: Option<String>,
    pub steps: Vec<StepResult>,
    pub on_failure: OnFailureResult,
    pub events: Vec<Event>,
    /// Allow-listed provider summary; never the live registry.
    pub providers: Value,
}

/// Kind of credential material behind a session handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionKind {
    Credential,
    OAuth,
    RemoteExecution,
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Credential => write!(f, "Credential"),
            Self::OAuth => write!(f, "OAuth"),
            Self::RemoteExecution => write!(f, "RemoteExecution"),
        }
    }
}

impl std::str::FromStr for SessionKind {
    type Err = SessionError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "credential" => Ok(Self::Credential),
            "oauth" => Ok(Self::OAuth),
            "remoteexecution" => Ok(Self::RemoteExecution),
            other => Err(SessionError::InvalidDescriptor(format!(
                "unknown session kind: {}",
                other
            ))),
        }
    }
}

/// Opaque credential/connection handle. Handlers borrow it; only the broker owns routing.
#[derive(Clone)]
pub struct SessionHandle(Arc<dyn Any + Send + Sync>);

impl SessionHandle {
    pub fn new<T: Any + Send + Sync>(inner: T) -> Self {
        Self(Arc::new(inner))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    /// Whether two handles point at the same underlying session.
    pub fn same_session(&self, other: &SessionHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionHandle(<opaque>)")
    }
}

#[derive(Debug, Clone)]
pub struct AuthSessionDescriptor {
    pub kind: SessionKind,
    pub session: SessionHandle,
}

impl AuthSessionDescriptor {
    pub fn new(kind: SessionKind, session: SessionHandle) -> Self {
        Self { kind, session }
    }

    /// Build from loosely-typed external data; the kind string is validated here.
    pub fn from_raw(kind: &str, session: SessionHandle) -> std::result::Result<Self, SessionError> {
        Ok(Self {
            kind: kind.parse()?,
            session,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn workflow_rejects_unknown_keys() {
        let doc = json!({
            "Name": "onboard",
            "LifecycleEvent": "Joiner",
            "Steps": [],
            "Schedule": "daily"
        });
        assert!(serde_json::from_value::<WorkflowDefinition>(doc).is_err());

        let step = json!({ "Name": "a", "Type": "EmitEvent", "Retries": 3 });
        assert!(serde_json::from_value::<StepSpec>(step).is_err());
    }

    #[test]
    fn request_snapshot_generates_correlation_id_once() {
        let req = LifecycleRequest::new(" Joiner ");
        let snap = req.snapshot().unwrap();
        assert_eq!(snap.lifecycle_event, "Joiner");
        let id = snap.correlation_id.clone().unwrap();
        assert!(!id.is_empty());
        // snapshotting a snapshot keeps the id
        assert_eq!(snap.snapshot().unwrap().correlation_id.unwrap(), id);
    }

    #[test]
    fn request_snapshot_is_detached_from_caller() {
        let mut req = LifecycleRequest::new("Joiner")
            .with_correlation_id("run-1")
            .with_desired("Department", "Sales");
        let snap = req.snapshot().unwrap();
        req.desired_state
            .insert("Department".into(), json!("Finance"));
        assert_eq!(snap.desired_state["Department"], json!("Sales"));
    }

    #[test]
    fn empty_lifecycle_event_rejected() {
        assert!(LifecycleRequest::new("  ").snapshot().is_err());
    }

    #[test]
    fn session_kind_parse() {
        assert_eq!("oauth".parse::<SessionKind>().unwrap(), SessionKind::OAuth);
        assert_eq!(
            "RemoteExecution".parse::<SessionKind>().unwrap(),
            SessionKind::RemoteExecution
        );
        assert!(matches!(
            "kerberos".parse::<SessionKind>(),
            Err(SessionError::InvalidDescriptor(_))
        ));
    }

    #[test]
    fn session_handle_debug_is_opaque() {
        let handle = SessionHandle::new("s3cr3t".to_string());
        assert!(!format!("{:?}", handle).contains("s3cr3t"));
        assert_eq!(handle.downcast_ref::<String>().unwrap(), "s3cr3t");
        assert!(handle.same_session(&handle.clone()));
    }
}
