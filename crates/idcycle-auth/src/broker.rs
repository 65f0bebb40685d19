use std::fmt;

use serde_json::{Map, Value};
use tracing::debug;

use idcycle_core::condition::values_equal;
use idcycle_core::config::AuthConfig;
use idcycle_core::error::{IdcycleError, Result, SessionError};
use idcycle_core::security::assert_no_executable_content;
use idcycle_core::traits::AuthSessionAcquirer;
use idcycle_core::types::{AuthSessionDescriptor, SessionHandle, SessionKind, AUTH_SESSION_NAME_KEY};

/// Credential material built from `[auth]` configuration. Never printed.
#[derive(Clone)]
pub struct ConfiguredCredential {
    pub kind: SessionKind,
    secret: String,
}

impl ConfiguredCredential {
    pub fn secret(&self) -> &str {
        &self.secret
    }
}

impl fmt::Debug for ConfiguredCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfiguredCredential")
            .field("kind", &self.kind)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// A registered route. The kind is kept as given and checked when the route is
/// selected, so one bad descriptor only affects requests that resolve to it.
struct Route {
    pattern: Map<String, Value>,
    kind: String,
    session: SessionHandle,
}

impl Route {
    fn session_name(&self) -> Option<&Value> {
        self.pattern.get(AUTH_SESSION_NAME_KEY)
    }

    fn resolve(&self) -> std::result::Result<SessionHandle, SessionError> {
        let _kind: SessionKind = self.kind.parse()?;
        Ok(self.session.clone())
    }
}

/// Routes `(name, options)` requests to registered auth sessions.
///
/// Resolution order:
/// 1. an empty name asks for the default session;
/// 2. routes whose `AuthSessionName` equals the name, where a name-only route
///    matches only when no options are given, and every other pattern attribute
///    must equal the corresponding option;
/// 3. otherwise legacy routes (no `AuthSessionName`) whose attributes are all
///    present and equal in a non-empty option record;
/// 4. exactly one match wins, more than one is `Ambiguous`, none falls back to
///    the default session or fails with `NoMatch`.
pub struct AuthSessionBroker {
    routes: Vec<Route>,
    default: Option<Route>,
}

impl AuthSessionBroker {
    pub fn builder() -> AuthSessionBrokerBuilder {
        AuthSessionBrokerBuilder::default()
    }

    /// Build a broker from `[auth]` configuration. Each credential string is
    /// wrapped in a [`ConfiguredCredential`] session handle.
    pub fn from_config(config: &AuthConfig) -> Result<Self> {
        let mut builder = Self::builder();
        if let Some(default) = &config.default {
            builder = builder.default_raw(&default.kind, configured_handle(&default.kind, &default.credential)?);
        }
        for route in &config.sessions {
            builder = builder.route_raw(
                Value::Object(route.pattern.clone()),
                &route.kind,
                configured_handle(&route.kind, &route.credential)?,
            );
        }
        builder.build()
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    pub fn has_default(&self) -> bool {
        self.default.is_some()
    }

    /// Resolve a session handle for `name` and optional routing `options`.
    pub fn acquire(
        &self,
        name: &str,
        options: Option<&Map<String, Value>>,
    ) -> Result<SessionHandle> {
        if let Some(options) = options {
            assert_no_executable_content(
                &Value::Object(options.clone()),
                "AuthSessionOptions",
            )?;
        }
        let name = name.trim();
        let options = options.filter(|o| !o.is_empty());

        if name.is_empty() {
            return self.resolve_default(None);
        }

        let named: Vec<&Route> = self
            .routes
            .iter()
            .filter(|r| {
                r.session_name()
                    .is_some_and(|n| values_equal(n, &Value::String(name.to_string())))
            })
            .filter(|r| named_route_matches(&r.pattern, options))
            .collect();

        let group = if named.is_empty() {
            match options {
                Some(options) => self
                    .routes
                    .iter()
                    .filter(|r| r.session_name().is_none())
                    .filter(|r| attributes_match(&r.pattern, options))
                    .collect(),
                None => vec![],
            }
        } else {
            named
        };

        match group.as_slice() {
            [route] => {
                debug!(session = %name, kind = %route.kind, "Auth session resolved");
                Ok(route.resolve()?)
            }
            [] => self.resolve_default(Some(name)),
            many => Err(SessionError::Ambiguous {
                name: name.to_string(),
                count: many.len(),
            }
            .into()),
        }
    }

    fn resolve_default(&self, requested: Option<&str>) -> Result<SessionHandle> {
        match (&self.default, requested) {
            (Some(default), _) => {
                debug!(session = requested.unwrap_or(""), "Auth session resolved to default");
                Ok(default.resolve()?)
            }
            (None, None) => Err(SessionError::NoDefaultConfigured.into()),
            (None, Some(name)) => Err(SessionError::NoMatch {
                name: name.to_string(),
            }
            .into()),
        }
    }
}

impl AuthSessionAcquirer for AuthSessionBroker {
    fn acquire(&self, name: &str, options: Option<&Map<String, Value>>) -> Result<SessionHandle> {
        AuthSessionBroker::acquire(self, name, options)
    }
}

impl fmt::Debug for AuthSessionBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthSessionBroker")
            .field("routes", &self.routes.len())
            .field("default", &self.default.is_some())
            .finish()
    }
}

fn named_route_matches(pattern: &Map<String, Value>, options: Option<&Map<String, Value>>) -> bool {
    let extra: Map<String, Value> = pattern
        .iter()
        .filter(|(k, _)| k.as_str() != AUTH_SESSION_NAME_KEY)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    match options {
        None => extra.is_empty(),
        Some(options) => !extra.is_empty() && attributes_match(&extra, options),
    }
}

fn attributes_match(pattern: &Map<String, Value>, options: &Map<String, Value>) -> bool {
    pattern
        .iter()
        .all(|(k, v)| options.get(k).is_some_and(|actual| values_equal(actual, v)))
}

fn configured_handle(kind: &str, credential: &str) -> Result<SessionHandle> {
    let kind: SessionKind = kind.parse()?;
    Ok(SessionHandle::new(ConfiguredCredential {
        kind,
        secret: credential.to_string(),
    }))
}

/// Collects routes; all validation happens in [`build`](Self::build).
#[derive(Default)]
pub struct AuthSessionBrokerBuilder {
    routes: Vec<(Value, String, SessionHandle)>,
    default: Option<(String, SessionHandle)>,
}

impl AuthSessionBrokerBuilder {
    pub fn route(self, pattern: Map<String, Value>, descriptor: AuthSessionDescriptor) -> Self {
        self.route_raw(
            Value::Object(pattern),
            &descriptor.kind.to_string(),
            descriptor.session,
        )
    }

    /// Register a route from loosely-typed external data.
    pub fn route_raw(mut self, pattern: Value, kind: &str, session: SessionHandle) -> Self {
        self.routes.push((pattern, kind.to_string(), session));
        self
    }

    pub fn default_session(self, descriptor: AuthSessionDescriptor) -> Self {
        self.default_raw(&descriptor.kind.to_string(), descriptor.session)
    }

    pub fn default_raw(mut self, kind: &str, session: SessionHandle) -> Self {
        self.default = Some((kind.to_string(), session));
        self
    }

    pub fn build(self) -> Result<AuthSessionBroker> {
        let mut routes = Vec::with_capacity(self.routes.len());
        for (i, (pattern, kind, session)) in self.routes.into_iter().enumerate() {
            let at = format!("AuthSessions[{}]", i);
            assert_no_executable_content(&pattern, &at)?;
            let pattern = validate_pattern(pattern, &at)?;
            routes.push(Route {
                pattern,
                kind,
                session,
            });
        }
        let default = self.default.map(|(kind, session)| Route {
            pattern: Map::new(),
            kind,
            session,
        });
        debug!(routes = routes.len(), default = default.is_some(), "Auth session broker built");
        Ok(AuthSessionBroker { routes, default })
    }
}

fn validate_pattern(pattern: Value, at: &str) -> Result<Map<String, Value>> {
    let Value::Object(map) = pattern else {
        return Err(SessionError::InvalidDescriptor(format!("{}: pattern must be an object", at)).into());
    };
    if map.is_empty() {
        return Err(
            SessionError::InvalidDescriptor(format!("{}: pattern must not be empty", at)).into(),
        );
    }
    for (key, value) in &map {
        if matches!(value, Value::Object(_) | Value::Array(_) | Value::Null) {
            return Err(SessionError::InvalidDescriptor(format!(
                "{}.{}: pattern values must be scalars",
                at, key
            ))
            .into());
        }
    }
    if let Some(name) = map.get(AUTH_SESSION_NAME_KEY) {
        if name.as_str().map_or(true, |n| n.trim().is_empty()) {
            return Err(IdcycleError::Session(SessionError::InvalidDescriptor(format!(
                "{}.{} must be a non-empty string",
                at, AUTH_SESSION_NAME_KEY
            ))));
        }
    }
    Ok(map)
}
