use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{IdcycleError, Result};
use crate::redact::DEFAULT_PLACEHOLDER;

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub redaction: RedactionConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub auth: Option<AuthConfig>,
}

/// Backoff settings for transient step failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Jitter spread: a delay is scaled by a factor in `[1 - ratio, 1 + ratio]`.
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_backoff() -> u64 {
    250
}
fn default_max_backoff() -> u64 {
    5000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_jitter_ratio() -> f64 {
    0.2
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter_ratio: default_jitter_ratio(),
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(IdcycleError::Config("retry.max_attempts must be >= 1".into()));
        }
        if !(self.backoff_multiplier >= 1.0) {
            return Err(IdcycleError::Config(
                "retry.backoff_multiplier must be >= 1.0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_ratio) {
            return Err(IdcycleError::Config(
                "retry.jitter_ratio must be within [0, 1]".into(),
            ));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(IdcycleError::Config(
                "retry.initial_backoff_ms must not exceed retry.max_backoff_ms".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedactionConfig {
    /// Additional key fragments treated as secret.
    #[serde(default)]
    pub extra_keys: Vec<String>,
    #[serde(default = "default_placeholder")]
    pub placeholder: String,
}

fn default_placeholder() -> String {
    DEFAULT_PLACEHOLDER.to_string()
}

impl Default for RedactionConfig {
    fn default() -> Self {
        Self {
            extra_keys: vec![],
            placeholder: default_placeholder(),
        }
    }
}

/// JSONL run log configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default)]
    pub dir: Option<String>,
    /// 1=run summary, 2=+step outcomes, 3=+retries and custom events.
    #[serde(default = "default_log_level")]
    pub level: u8,
}

fn default_log_level() -> u8 {
    1
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: None,
            level: default_log_level(),
        }
    }
}

/// Auth session routes for hosts that build a broker from configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub default: Option<SessionConfig>,
    #[serde(default)]
    pub sessions: Vec<SessionRouteConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub kind: String,
    /// Credential reference; usually `${ENV_VAR}`. Only ever stored inside a session handle.
    pub credential: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRouteConfig {
    pub pattern: Map<String, Value>,
    pub kind: String,
    pub credential: String,
}

impl EngineConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| IdcycleError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| IdcycleError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.retry.validate()?;
        if !(1..=3).contains(&self.log.level) {
            return Err(IdcycleError::Config("log.level must be 1, 2, or 3".into()));
        }
        Ok(())
    }

    /// Resolve the log directory (expand ~).
    pub fn log_dir(&self) -> Option<PathBuf> {
        let dir = self.log.dir.as_deref()?;
        if let Some(rest) = dir.strip_prefix("~/") {
            if let Some(home) = dirs_home() {
                return Some(home.join(rest));
            }
        }
        Some(PathBuf::from(dir))
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
