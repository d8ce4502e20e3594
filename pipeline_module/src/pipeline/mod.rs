mod core;
mod types;

pub use core::BatchRunner;
pub use types::{BatchRunResult, PipelineError, TenantRunResult};
