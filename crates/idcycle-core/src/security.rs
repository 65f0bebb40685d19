use serde_json::Value;

use crate::error::{IdcycleError, Result};

/// Object keys that mark a value as embedded code rather than data.
///
/// Workflow documents, step configuration, provider configuration, and auth-session
/// options are pure data. Any object carrying one of these keys (compared
/// case-insensitively) is rejected wherever it appears.
pub const EXECUTABLE_MARKERS: &[&str] = &[
    "$script", "$code", "$expr", "$eval", "$exec", "$function", "$lambda",
];

/// Reject embedded executable content anywhere inside `value`.
///
/// Walks every object and array. The first violation is reported with a
/// dotted/bracketed path rooted at `path`, e.g. `Workflow.Steps[2].With.Config`.
pub fn assert_no_executable_content(value: &Value, path: &str) -> Result<()> {
    match value {
        Value::Object(map) => {
            if let Some(marker) = map.keys().find(|k| is_executable_marker(k)) {
                return Err(IdcycleError::SecurityViolation {
                    path: path.to_string(),
                    reason: format!("embedded executable content ('{}') is not allowed", marker),
                });
            }
            for (key, child) in map {
                assert_no_executable_content(child, &child_path(path, key))?;
            }
            Ok(())
        }
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                assert_no_executable_content(item, &format!("{}[{}]", path, i))?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn is_executable_marker(key: &str) -> bool {
    EXECUTABLE_MARKERS
        .iter()
        .any(|marker| marker.eq_ignore_ascii_case(key))
}

fn child_path(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", parent, key)
    }
}
