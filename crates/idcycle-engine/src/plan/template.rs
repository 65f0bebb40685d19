use serde_json::{Map, Value};

use idcycle_core::condition::{resolve_path, scalar_text};
use idcycle_core::error::{IdcycleError, Result};

/// Resolve `{{Path}}` placeholders in every string inside `with`.
///
/// A string that is exactly one placeholder takes the resolved JSON value as
/// is; placeholders embedded in longer text must resolve to scalars. A
/// placeholder that resolves to nothing (or null) is a validation error.
pub fn resolve_templates(
    with: &Map<String, Value>,
    context: &Value,
    at: &str,
) -> Result<Map<String, Value>> {
    with.iter()
        .map(|(k, v)| Ok((k.clone(), resolve_value(v, context, &format!("{}.{}", at, k))?)))
        .collect()
}

fn resolve_value(value: &Value, context: &Value, at: &str) -> Result<Value> {
    match value {
        Value::String(s) => resolve_string(s, context, at),
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, v)| resolve_value(v, context, &format!("{}[{}]", at, i)))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Value::Object(map) => resolve_templates(map, context, at).map(Value::Object),
        other => Ok(other.clone()),
    }
}

fn resolve_string(s: &str, context: &Value, at: &str) -> Result<Value> {
    if !s.contains("{{") {
        return Ok(Value::String(s.to_string()));
    }

    let trimmed = s.trim();
    if let Some(path) = single_placeholder(trimmed) {
        return lookup(context, path, at).cloned();
    }

    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| invalid(at, "unterminated '{{' placeholder"))?;
        let path = after[..end].trim();
        let value = lookup(context, path, at)?;
        let text = scalar_text(value).ok_or_else(|| {
            invalid(
                at,
                format!("placeholder '{}' resolves to a non-scalar value inside text", path),
            )
        })?;
        out.push_str(&text);
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(Value::String(out))
}

/// `Some(path)` when `s` is exactly `{{ path }}`.
fn single_placeholder(s: &str) -> Option<&str> {
    let inner = s.strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner.trim())
}

fn lookup<'a>(context: &'a Value, path: &str, at: &str) -> Result<&'a Value> {
    if path.is_empty() {
        return Err(invalid(at, "empty placeholder"));
    }
    match resolve_path(context, path) {
        Some(Value::Null) | None => Err(invalid(
            at,
            format!("placeholder '{}' does not resolve", path),
        )),
        Some(value) => Ok(value),
    }
}

fn invalid(at: &str, message: impl std::fmt::Display) -> IdcycleError {
    IdcycleError::validation(format!("invalid template at {}: {}", at, message))
}
