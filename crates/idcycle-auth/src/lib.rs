pub mod broker;

pub use broker::{AuthSessionBroker, AuthSessionBrokerBuilder, ConfiguredCredential};
