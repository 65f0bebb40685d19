pub mod condition;
pub mod config;
pub mod error;
pub mod event;
pub mod redact;
pub mod security;
pub mod traits;
pub mod types;

pub use condition::Condition;
pub use config::EngineConfig;
pub use error::{IdcycleError, Result, SessionError};
pub use event::{Event, EventBus, EventRecorder, EventSink};
pub use redact::Redactor;
pub use traits::{AuthSessionAcquirer, Provider, ProviderRegistry, StepHandler};
pub use types::*;
