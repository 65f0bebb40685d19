use std::collections::{BTreeMap, BTreeSet};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;

use idcycle_core::error::{IdcycleError, Result};
use idcycle_core::traits::Provider;
use idcycle_core::types::SessionHandle;

/// One identity held by [`InMemoryIdentityProvider`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IdentityRecord {
    #[serde(default)]
    pub attributes: Map<String, Value>,
    #[serde(default)]
    pub entitlements: BTreeSet<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub container: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl Default for IdentityRecord {
    fn default() -> Self {
        Self {
            attributes: Map::new(),
            entitlements: BTreeSet::new(),
            enabled: true,
            container: None,
        }
    }
}

/// Idempotent in-memory identity directory. Reference backend for the CLI and tests.
pub struct InMemoryIdentityProvider {
    identities: Mutex<BTreeMap<String, IdentityRecord>>,
    config: Value,
}

pub const IN_MEMORY_CAPABILITIES: &[&str] = &[
    "Identity.Read",
    "Identity.Create",
    "Identity.Attribute.Ensure",
    "Entitlement.Ensure",
    "Identity.Disable",
    "Identity.Move",
    "Identity.Delete",
];

impl InMemoryIdentityProvider {
    pub fn new() -> Self {
        Self {
            identities: Mutex::new(BTreeMap::new()),
            config: json!({ "Backend": "memory" }),
        }
    }

    /// Seed from a JSON object mapping identity keys to records.
    pub fn from_seed(seed: &Value) -> Result<Self> {
        let identities: BTreeMap<String, IdentityRecord> = serde_json::from_value(seed.clone())?;
        Ok(Self {
            identities: Mutex::new(identities),
            ..Self::new()
        })
    }

    /// Replace the declared configuration (guarded by the engine, never exported).
    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub async fn insert(&self, key: impl Into<String>, record: IdentityRecord) {
        self.identities.lock().await.insert(key.into(), record);
    }

    pub async fn get(&self, key: &str) -> Option<IdentityRecord> {
        self.identities.lock().await.get(key).cloned()
    }

    pub async fn snapshot(&self) -> BTreeMap<String, IdentityRecord> {
        self.identities.lock().await.clone()
    }

    /// Apply `f` to an existing identity; returns whether it reported a change.
    async fn update<F>(&self, key: &str, f: F) -> Result<bool>
    where
        F: FnOnce(&mut IdentityRecord) -> bool,
    {
        let mut identities = self.identities.lock().await;
        match identities.get_mut(key) {
            Some(record) => Ok(f(record)),
            None => Err(not_found(key)),
        }
    }
}

impl Default for InMemoryIdentityProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn not_found(key: &str) -> IdcycleError {
    IdcycleError::Provider {
        provider: "InMemory".into(),
        message: format!("identity '{}' not found", key),
    }
}

impl Provider for InMemoryIdentityProvider {
    fn kind(&self) -> &str {
        "InMemory"
    }

    fn capabilities(&self) -> Vec<String> {
        IN_MEMORY_CAPABILITIES.iter().map(|c| c.to_string()).collect()
    }

    fn config(&self) -> Value {
        self.config.clone()
    }

    fn get_identity(
        &self,
        key: String,
        _session: Option<SessionHandle>,
    ) -> BoxFuture<'_, Result<Option<Value>>> {
        Box::pin(async move {
            match self.get(&key).await {
                Some(record) => Ok(Some(serde_json::to_value(record)?)),
                None => Ok(None),
            }
        })
    }

    fn create_identity(
        &self,
        key: String,
        attributes: Map<String, Value>,
        _session: Option<SessionHandle>,
    ) -> BoxFuture<'_, Result<bool>> {
        Box::pin(async move {
            let mut identities = self.identities.lock().await;
            if identities.contains_key(&key) {
                return Ok(false);
            }
            identities.insert(
                key,
                IdentityRecord {
                    attributes,
                    ..Default::default()
                },
            );
            Ok(true)
        })
    }

    fn ensure_attribute(
        &self,
        key: String,
        name: String,
        value: Value,
        _session: Option<SessionHandle>,
    ) -> BoxFuture<'_, Result<bool>> {
        Box::pin(async move {
            self.update(&key, |record| {
                if record.attributes.get(&name) == Some(&value) {
                    false
                } else {
                    record.attributes.insert(name, value);
                    true
                }
            })
            .await
        })
    }

    fn ensure_entitlement(
        &self,
        key: String,
        entitlement: String,
        present: bool,
        _session: Option<SessionHandle>,
    ) -> BoxFuture<'_, Result<bool>> {
        Box::pin(async move {
            self.update(&key, |record| {
                if present {
                    record.entitlements.insert(entitlement)
                } else {
                    record.entitlements.remove(&entitlement)
                }
            })
            .await
        })
    }

    fn disable_identity(
        &self,
        key: String,
        _session: Option<SessionHandle>,
    ) -> BoxFuture<'_, Result<bool>> {
        Box::pin(async move {
            self.update(&key, |record| {
                let changed = record.enabled;
                record.enabled = false;
                changed
            })
            .await
        })
    }

    fn move_identity(
        &self,
        key: String,
        container: String,
        _session: Option<SessionHandle>,
    ) -> BoxFuture<'_, Result<bool>> {
        Box::pin(async move {
            self.update(&key, |record| {
                if record.container.as_deref() == Some(container.as_str()) {
                    false
                } else {
                    record.container = Some(container);
                    true
                }
            })
            .await
        })
    }

    fn delete_identity(
        &self,
        key: String,
        _session: Option<SessionHandle>,
    ) -> BoxFuture<'_, Result<bool>> {
        Box::pin(async move { Ok(self.identities.lock().await.remove(&key).is_some()) })
    }
}
