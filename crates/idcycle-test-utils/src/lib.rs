//! Test doubles shared across idcycle crates.

pub mod fixtures;
mod handler;
mod provider;
mod sink;

pub use handler::{Scripted, ScriptedHandler};
pub use provider::{StaticAcquirer, StaticProvider};
pub use sink::RecordingSink;
