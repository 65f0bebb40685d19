use serde_json::{Map, Value};

use crate::config::RedactionConfig;

/// Key fragments that mark a value as secret. Matched case-insensitively against
/// object keys with `_`/`-` removed.
const DEFAULT_SECRET_KEYS: &[&str] = &[
    "password",
    "passwd",
    "secret",
    "token",
    "credential",
    "apikey",
    "privatekey",
    "connectionstring",
    "certificate",
    "authsession",
];

pub const DEFAULT_PLACEHOLDER: &str = "[REDACTED]";

/// Deny-list redaction for data leaving the engine (events, step output, plan export).
///
/// `AuthSessionName` is kept: it is a routing key, not a secret.
#[derive(Debug, Clone)]
pub struct Redactor {
    keys: Vec<String>,
    placeholder: String,
}

impl Default for Redactor {
    fn default() -> Self {
        Self::new(&RedactionConfig::default())
    }
}

impl Redactor {
    pub fn new(config: &RedactionConfig) -> Self {
        let mut keys: Vec<String> = DEFAULT_SECRET_KEYS.iter().map(|k| k.to_string()).collect();
        keys.extend(config.extra_keys.iter().map(|k| normalize_key(k)));
        keys.retain(|k| !k.is_empty());
        keys.sort();
        keys.dedup();
        Self {
            keys,
            placeholder: config.placeholder.clone(),
        }
    }

    pub fn is_secret_key(&self, key: &str) -> bool {
        let normalized = normalize_key(key);
        if normalized == "authsessionname" {
            return false;
        }
        self.keys.iter().any(|k| normalized.contains(k.as_str()))
    }

    /// Deep copy of `value` with every secret-keyed entry replaced by the placeholder.
    pub fn redact(&self, value: &Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(self.redact_map(map)),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.redact(v)).collect()),
            other => other.clone(),
        }
    }

    pub fn redact_map(&self, map: &Map<String, Value>) -> Map<String, Value> {
        map.iter()
            .map(|(k, v)| {
                let value = if self.is_secret_key(k) {
                    Value::String(self.placeholder.clone())
                } else {
                    self.redact(v)
                };
                (k.clone(), value)
            })
            .collect()
    }
}

fn normalize_key(key: &str) -> String {
    key.chars()
        .filter(|c| *c != '_' && *c != '-')
        .collect::<String>()
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn nested_secrets_redacted() {
        let r = Redactor::default();
        let out = r.redact(&json!({
            "User": "alice",
            "Connection": { "client_secret": "abc", "Host": "dc01" },
            "Items": [ { "ApiKey": "k-1" }, { "Name": "ok" } ],
            "AuthSessionName": "AD",
            "AuthSessionOptions": { "Role": "Admin" }
        }));
        assert_eq!(out["User"], json!("alice"));
        assert_eq!(out["Connection"]["client_secret"], json!(DEFAULT_PLACEHOLDER));
        assert_eq!(out["Connection"]["Host"], json!("dc01"));
        assert_eq!(out["Items"][0]["ApiKey"], json!(DEFAULT_PLACEHOLDER));
        assert_eq!(out["Items"][1]["Name"], json!("ok"));
        assert_eq!(out["AuthSessionName"], json!("AD"));
        assert_eq!(out["AuthSessionOptions"], json!(DEFAULT_PLACEHOLDER));
    }

    #[test]
    fn extra_keys_and_placeholder_configurable() {
        let r = Redactor::new(&RedactionConfig {
            extra_keys: vec!["Social-Security".into()],
            placeholder: "***".into(),
        });
        let out = r.redact(&json!({ "SocialSecurityNumber": "123", "Token": "t" }));
        assert_eq!(out["SocialSecurityNumber"], json!("***"));
        assert_eq!(out["Token"], json!("***"));
    }
}
