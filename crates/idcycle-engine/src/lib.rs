pub mod context;
pub mod executor;
pub mod plan;
pub mod retry;
pub mod run_log;

pub use context::ExecutionContext;
pub use executor::Executor;
pub use plan::{export_plan, PlanBuilder, WorkflowFile, WorkflowSource};
pub use retry::{retry_seed, Backoff, RetryPolicy};
pub use run_log::{event_capacity, RunLogger};
