use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Map, Value};

use crate::error::{IdcycleError, Result};

/// Declarative boolean condition attached to a workflow step.
///
/// Document shapes (one operator key per object):
/// - `true` / `false`
/// - `{"Exists": "Request.DesiredState.Department"}`
/// - `{"Equals": {"Path": "Plan.LifecycleEvent", "Value": "Joiner"}}`
/// - `{"NotEquals": {"Path": ..., "Value": ...}}`
/// - `{"In": {"Path": ..., "Values": [..]}}`
/// - `{"All": [..]}`, `{"Any": [..]}`, `{"None": [..]}`
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Literal(bool),
    Exists(String),
    Equals { path: String, value: Value },
    NotEquals { path: String, value: Value },
    In { path: String, values: Vec<Value> },
    All(Vec<Condition>),
    Any(Vec<Condition>),
    None(Vec<Condition>),
}

impl Condition {
    /// Parse and strictly validate a condition document.
    ///
    /// `at` is the location used in error messages (e.g. `Steps[1].Condition`).
    pub fn parse(value: &Value, at: &str) -> Result<Self> {
        let map = match value {
            Value::Bool(b) => return Ok(Self::Literal(*b)),
            Value::Object(map) => map,
            other => {
                return Err(invalid(
                    at,
                    format!("expected a boolean or an operator object, found {}", type_name(other)),
                ))
            }
        };

        if map.len() != 1 {
            let keys: Vec<&str> = map.keys().map(|k| k.as_str()).collect();
            return Err(invalid(
                at,
                format!(
                    "expected exactly one operator key, found [{}]",
                    keys.join(", ")
                ),
            ));
        }

        let Some((op, operand)) = map.iter().next() else {
            return Err(invalid(at, "empty condition object"));
        };
        let op_at = format!("{}.{}", at, op);

        match op.as_str() {
            "Exists" => Ok(Self::Exists(parse_path(operand, &op_at)?)),
            "Equals" => {
                let (path, value) = parse_comparison(operand, &op_at)?;
                Ok(Self::Equals { path, value })
            }
            "NotEquals" => {
                let (path, value) = parse_comparison(operand, &op_at)?;
                Ok(Self::NotEquals { path, value })
            }
            "In" => {
                let fields = operand_fields(operand, &op_at, &["Path", "Values"])?;
                let path = parse_path(required(fields, "Path", &op_at)?, &format!("{}.Path", op_at))?;
                let values = match required(fields, "Values", &op_at)? {
                    Value::Array(items) if !items.is_empty() => items.clone(),
                    _ => return Err(invalid(&op_at, "'Values' must be a non-empty list")),
                };
                Ok(Self::In { path, values })
            }
            "All" => Ok(Self::All(parse_children(operand, &op_at)?)),
            "Any" => Ok(Self::Any(parse_children(operand, &op_at)?)),
            "None" => Ok(Self::None(parse_children(operand, &op_at)?)),
            unknown => Err(invalid(at, format!("unknown condition operator '{}'", unknown))),
        }
    }

    /// Evaluate against a read-only context document. Pure: no I/O, no mutation.
    pub fn evaluate(&self, context: &Value) -> bool {
        match self {
            Self::Literal(b) => *b,
            Self::Exists(path) => resolve_path(context, path).is_some_and(|v| !v.is_null()),
            Self::Equals { path, value } => {
                resolve_path(context, path).is_some_and(|actual| values_equal(actual, value))
            }
            Self::NotEquals { path, value } => {
                !resolve_path(context, path).is_some_and(|actual| values_equal(actual, value))
            }
            Self::In { path, values } => resolve_path(context, path)
                .is_some_and(|actual| values.iter().any(|v| values_equal(actual, v))),
            Self::All(children) => children.iter().all(|c| c.evaluate(context)),
            Self::Any(children) => children.iter().any(|c| c.evaluate(context)),
            Self::None(children) => !children.iter().any(|c| c.evaluate(context)),
        }
    }

    /// Convert back to the document shape accepted by [`Condition::parse`].
    pub fn to_value(&self) -> Value {
        match self {
            Self::Literal(b) => Value::Bool(*b),
            Self::Exists(path) => json!({ "Exists": path }),
            Self::Equals { path, value } => json!({ "Equals": { "Path": path, "Value": value } }),
            Self::NotEquals { path, value } => {
                json!({ "NotEquals": { "Path": path, "Value": value } })
            }
            Self::In { path, values } => json!({ "In": { "Path": path, "Values": values } }),
            Self::All(children) => json!({ "All": children_to_values(children) }),
            Self::Any(children) => json!({ "Any": children_to_values(children) }),
            Self::None(children) => json!({ "None": children_to_values(children) }),
        }
    }
}

impl Serialize for Condition {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Condition {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Condition::parse(&value, "Condition").map_err(serde::de::Error::custom)
    }
}

/// Resolve a dotted/indexed path (`Request.Changes.Groups[0].Id`) inside a document.
///
/// Returns `None` when any segment is missing or the shape does not match.
pub fn resolve_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.') {
        let (key, indexes) = split_indexes(segment)?;
        if !key.is_empty() {
            current = current.as_object()?.get(key)?;
        }
        for index in indexes {
            current = current.as_array()?.get(index)?;
        }
    }
    Some(current)
}

/// Split `Groups[0][1]` into `("Groups", [0, 1])`.
fn split_indexes(segment: &str) -> Option<(&str, Vec<usize>)> {
    let Some(open) = segment.find('[') else {
        return Some((segment, vec![]));
    };
    let key = &segment[..open];
    let mut indexes = Vec::new();
    let mut rest = &segment[open..];
    while !rest.is_empty() {
        let inner = rest.strip_prefix('[')?;
        let close = inner.find(']')?;
        indexes.push(inner[..close].trim().parse().ok()?);
        rest = &inner[close + 1..];
    }
    Some((key, indexes))
}

/// JSON equality, with scalars compared by their string form so `"42"` equals `42`.
pub fn values_equal(actual: &Value, expected: &Value) -> bool {
    if actual == expected {
        return true;
    }
    match (scalar_text(actual), scalar_text(expected)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

pub fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn parse_comparison(operand: &Value, at: &str) -> Result<(String, Value)> {
    let fields = operand_fields(operand, at, &["Path", "Value"])?;
    let path = parse_path(required(fields, "Path", at)?, &format!("{}.Path", at))?;
    let value = required(fields, "Value", at)?.clone();
    Ok((path, value))
}

fn parse_children(operand: &Value, at: &str) -> Result<Vec<Condition>> {
    let items = match operand {
        Value::Array(items) if !items.is_empty() => items,
        Value::Array(_) => return Err(invalid(at, "expected at least one child condition")),
        other => {
            return Err(invalid(
                at,
                format!("expected a list of conditions, found {}", type_name(other)),
            ))
        }
    };
    items
        .iter()
        .enumerate()
        .map(|(i, item)| Condition::parse(item, &format!("{}[{}]", at, i)))
        .collect()
}

fn parse_path(value: &Value, at: &str) -> Result<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => {
            let path = s.trim();
            if path.split('.').any(|seg| split_indexes(seg).is_none() || seg.is_empty()) {
                return Err(invalid(at, format!("malformed path '{}'", path)));
            }
            Ok(path.to_string())
        }
        _ => Err(invalid(at, "expected a non-empty path string")),
    }
}

fn operand_fields<'a>(
    operand: &'a Value,
    at: &str,
    allowed: &[&str],
) -> Result<&'a Map<String, Value>> {
    let fields = operand
        .as_object()
        .ok_or_else(|| invalid(at, "expected an object operand"))?;
    if let Some(unknown) = fields.keys().find(|k| !allowed.contains(&k.as_str())) {
        return Err(invalid(at, format!("unknown key '{}'", unknown)));
    }
    Ok(fields)
}

fn required<'a>(fields: &'a Map<String, Value>, key: &str, at: &str) -> Result<&'a Value> {
    fields
        .get(key)
        .ok_or_else(|| invalid(at, format!("missing required key '{}'", key)))
}

fn children_to_values(children: &[Condition]) -> Vec<Value> {
    children.iter().map(Condition::to_value).collect()
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

fn invalid(at: &str, message: impl std::fmt::Display) -> IdcycleError {
    IdcycleError::Validation(format!("invalid condition at {}: {}", at, message))
}
