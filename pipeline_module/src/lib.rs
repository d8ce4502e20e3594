pub mod activity_store;
pub mod classifier;
pub mod mailbox;
pub mod notification_store;
pub mod service;
pub mod tenant_store;
pub mod token_vault;

mod pipeline;

pub use pipeline::{BatchRunResult, BatchRunner, PipelineError, TenantRunResult};
pub use service::{run_server, ServiceConfig};
