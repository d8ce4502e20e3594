use serde::Serialize;

/// Summary of one tenant's slice of a batch run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantRunResult {
    pub tenant_id: String,
    /// Messages attempted (fetched and classified, or failed fetching).
    pub processed: usize,
    /// Non-error outcomes: replies sent, escalations, and skips.
    pub success_count: usize,
    pub error_count: usize,
    /// Human-readable notes, one per error or skip condition.
    pub errors: Vec<String>,
}

impl TenantRunResult {
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            processed: 0,
            success_count: 0,
            error_count: 0,
            errors: Vec::new(),
        }
    }
}

/// Aggregate summary of a whole batch run, returned to the trigger caller.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRunResult {
    pub users_processed: usize,
    pub total_processed: usize,
    pub total_success: usize,
    pub total_errors: usize,
    pub results: Vec<TenantRunResult>,
}

impl BatchRunResult {
    pub fn from_tenant_results(results: Vec<TenantRunResult>) -> Self {
        Self {
            users_processed: results.len(),
            total_processed: results.iter().map(|r| r.processed).sum(),
            total_success: results.iter().map(|r| r.success_count).sum(),
            total_errors: results.iter().map(|r| r.error_count).sum(),
            results,
        }
    }
}

/// A batch run only fails outright when the tenant roster itself cannot be
/// read; everything downstream degrades to per-tenant or per-message notes.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("tenant roster unavailable: {0}")]
    TenantRoster(#[from] crate::tenant_store::TenantStoreError),
    #[error("token vault unavailable: {0}")]
    TokenVault(#[from] crate::token_vault::TokenVaultError),
}
