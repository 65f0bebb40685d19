//! Workflow loading, validation, and normalization into an immutable [`Plan`].
//!
//! [`Plan`]: idcycle_core::types::Plan

mod builder;
mod export;
mod source;
mod template;

pub use builder::{PlanBuilder, CAPABILITY_PATTERN};
pub use export::{export_plan, write_plan_export, PLAN_SCHEMA_VERSION};
pub use source::{read_document, WorkflowFile, WorkflowSource};
pub use template::resolve_templates;
