use std::path::Path;

use serde_json::{json, Map, Value};

use idcycle_core::error::Result;
use idcycle_core::redact::Redactor;
use idcycle_core::types::Plan;

/// Bumped only on breaking changes to the export layout.
pub const PLAN_SCHEMA_VERSION: u32 = 1;

/// Canonical plan export: pretty-printed UTF-8 JSON (no BOM), object keys
/// sorted, secrets redacted, wrapped as `{"Plan": ..., "SchemaVersion": 1}`.
pub fn export_plan(plan: &Plan, redactor: &Redactor) -> Result<String> {
    let plan = redactor.redact(&serde_json::to_value(plan)?);
    let doc = sort_keys(json!({
        "SchemaVersion": PLAN_SCHEMA_VERSION,
        "Plan": plan,
    }));
    let mut out = serde_json::to_string_pretty(&doc)?;
    out.push('\n');
    Ok(out)
}

pub fn write_plan_export(plan: &Plan, redactor: &Redactor, path: &Path) -> Result<()> {
    std::fs::write(path, export_plan(plan, redactor)?.as_bytes())?;
    Ok(())
}

fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, sort_keys(v)))
                    .collect::<Map<String, Value>>(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use idcycle_core::types::PlanStepStatus;
    use idcycle_core::Condition;
    use idcycle_test_utils::fixtures;

    fn plan() -> Plan {
        let mut step = fixtures::plan_step(
            0,
            "Create",
            "CreateIdentity",
            json!({ "IdentityKey": "alice", "InitialPassword": "Winter2024!" }),
        );
        step.condition = Some(
            Condition::parse(&json!({ "Exists": "Request.IdentityKeys.UserName" }), "c").unwrap(),
        );
        step.requires_capabilities = vec!["Identity.Create".into()];
        let mut skipped = fixtures::plan_step(1, "Notify", "EmitEvent", json!({ "Message": "hi" }));
        skipped.status = PlanStepStatus::NotApplicable;
        Plan {
            workflow_name: "Joiner".into(),
            lifecycle_event: "Joiner".into(),
            correlation_id: "corr-1".into(),
            request: fixtures::request("Joiner").with_change("ApiToken", "tok-123"),
            steps: vec![step, skipped],
            on_failure_steps: vec![],
            created_utc: chrono::Utc::now(),
        }
    }

    #[test]
    fn export_is_canonical_and_redacted() {
        let text = export_plan(&plan(), &Redactor::default()).unwrap();
        assert!(!text.starts_with('\u{feff}'));
        assert!(text.ends_with('\n'));
        assert!(!text.contains("Winter2024!"));
        assert!(!text.contains("tok-123"));

        let doc: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(doc["SchemaVersion"], json!(1));
        let steps = &doc["Plan"]["Steps"];
        assert_eq!(steps[0]["Type"], json!("CreateIdentity"));
        assert_eq!(steps[0]["Status"], json!("Planned"));
        assert_eq!(
            steps[0]["Condition"],
            json!({ "Exists": "Request.IdentityKeys.UserName" })
        );
        assert_eq!(steps[1]["Status"], json!("NotApplicable"));
        assert_eq!(doc["Plan"]["Request"]["IdentityKeys"]["UserName"], json!("alice"));

        // top-level keys appear in sorted order
        let plan_pos = text.find("\"Plan\"").unwrap();
        let schema_pos = text.find("\"SchemaVersion\"").unwrap();
        assert!(plan_pos < schema_pos);
    }

    #[test]
    fn export_is_stable_for_same_plan() {
        let plan = plan();
        let r = Redactor::default();
        assert_eq!(export_plan(&plan, &r).unwrap(), export_plan(&plan, &r).unwrap());
    }

    #[test]
    fn writes_file_without_bom() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.json");
        write_plan_export(&plan(), &Redactor::default(), &path).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes[0], b'{');
    }
}
