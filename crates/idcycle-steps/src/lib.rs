pub mod builtin;
pub mod mock;
pub mod registry;

pub use mock::{IdentityRecord, InMemoryIdentityProvider};
pub use registry::StepRegistry;
