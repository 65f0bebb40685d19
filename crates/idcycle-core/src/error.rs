use thiserror::Error;

#[derive(Debug, Error)]
pub enum IdcycleError {
    // Planning errors
    #[error("Workflow validation failed: {0}")]
    Validation(String),

    #[error("Security violation at {path}: {reason}")]
    SecurityViolation { path: String, reason: String },

    #[error(
        "Missing required capabilities: [{}] (required by steps: [{}]; available: [{}])",
        .missing.join(", "),
        .affected_steps.join(", "),
        .available.join(", ")
    )]
    Capability {
        missing: Vec<String>,
        affected_steps: Vec<String>,
        available: Vec<String>,
    },

    // Step errors
    #[error("No handler registered for step type: {step_type}")]
    Dispatch { step_type: String },

    #[error("Transient step failure: {0}")]
    Transient(String),

    #[error("Step failed: {0}")]
    Step(String),

    #[error("Provider error: {provider}: {message}")]
    Provider { provider: String, message: String },

    // Auth session errors
    #[error(transparent)]
    Session(#[from] SessionError),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl IdcycleError {
    /// Only errors explicitly tagged transient by a handler or provider are retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn step(message: impl Into<String>) -> Self {
        Self::Step(message.into())
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Short machine-readable category used in step results and events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "ValidationError",
            Self::SecurityViolation { .. } => "SecurityViolation",
            Self::Capability { .. } => "CapabilityError",
            Self::Dispatch { .. } => "DispatchError",
            Self::Transient(_) => "TransientStepError",
            Self::Step(_) | Self::Provider { .. } => "StepError",
            Self::Session(_) => "SessionError",
            Self::Config(_) | Self::ConfigNotFound(_) => "ConfigError",
            Self::Io(_) | Self::Json(_) | Self::Toml(_) => "IoError",
        }
    }
}

/// Auth session routing failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("No default auth session configured")]
    NoDefaultConfigured,

    #[error("No auth session matches name '{name}' with the given options")]
    NoMatch { name: String },

    #[error("Ambiguous auth session '{name}': {count} routes match the given options")]
    Ambiguous { name: String, count: usize },

    #[error("Invalid auth session descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Step '{step}' requests auth session '{name}' but no auth session broker is configured")]
    NotConfigured { step: String, name: String },
}

pub type Result<T> = std::result::Result<T, IdcycleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_is_retryable() {
        assert!(IdcycleError::transient("throttled").is_transient());
        assert!(!IdcycleError::step("boom").is_transient());
        assert!(!IdcycleError::Dispatch {
            step_type: "Nope".into()
        }
        .is_transient());
        assert!(!IdcycleError::from(SessionError::NoDefaultConfigured).is_transient());
    }

    #[test]
    fn capability_error_lists_everything() {
        let err = IdcycleError::Capability {
            missing: vec!["Identity.Create".into()],
            affected_steps: vec!["Create account".into()],
            available: vec!["Identity.Read".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("Identity.Create"));
        assert!(msg.contains("Create account"));
        assert!(msg.contains("Identity.Read"));
        assert_eq!(err.kind(), "CapabilityError");
    }
}
