//! Batch orchestration: walk every automation-enabled tenant, pull unread
//! mail, classify, and either reply, escalate, or skip.
//!
//! Tenants are processed sequentially and in isolation; one tenant's
//! failure never stops the run. Within a tenant, one message's failure
//! never stops the rest of its messages. Exactly one activity entry is
//! recorded per attempted message.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use send_replies_module::{
    mark_processed, normalize_reply_subject, send_reply, ProviderHandle, ReplyRequest,
};

use crate::activity_store::{ActivityAction, ActivityStore, NewActivityEntry};
use crate::classifier::{AnalysisResult, Category, Classifier, ClassifierConfig};
use crate::mailbox::{MailboxSession, NormalizedMessage};
use crate::notification_store::NotificationStore;
use crate::service::ServiceConfig;
use crate::tenant_store::{BusinessContext, TenantRecord, TenantStore};
use crate::token_vault::{TokenState, TokenVault};

use super::types::{BatchRunResult, PipelineError, TenantRunResult};

const NOTIFICATION_TITLE: &str = "Inbox automation";
const NOTIFICATION_SUBJECT_CAP: usize = 3;

/// What to do with one classified message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Reply,
    Escalate,
    Skip,
}

fn decide(analysis: &AnalysisResult, threshold: f64) -> Disposition {
    if analysis.category == Category::Spam {
        Disposition::Skip
    } else if analysis.confidence < threshold {
        Disposition::Escalate
    } else {
        Disposition::Reply
    }
}

pub struct BatchRunner {
    tenant_store: TenantStore,
    token_vault: TokenVault,
    classifier: Classifier,
    activity_store: ActivityStore,
    notification_store: NotificationStore,
    mailbox_api_base: String,
    message_limit: usize,
    http_timeout: Duration,
}

impl BatchRunner {
    pub fn from_config(config: &ServiceConfig) -> Result<Self, PipelineError> {
        let tenant_store = TenantStore::new(config.tenants_db_path.clone())?;
        let token_vault = TokenVault::new(
            config.tokens_db_path.clone(),
            config.oauth_token_url.as_str(),
            config.oauth_client_id.as_str(),
            config.oauth_client_secret.as_str(),
            config.http_timeout,
        )?;
        let classifier = Classifier::new(ClassifierConfig {
            api_url: config.ai_api_url.clone(),
            api_key: config.ai_api_key.clone(),
            model: config.ai_model.clone(),
        });
        Ok(Self {
            tenant_store,
            token_vault,
            classifier,
            activity_store: ActivityStore::new(&config.activity_db_path),
            notification_store: NotificationStore::new(&config.notifications_db_path),
            mailbox_api_base: config.mailbox_api_base.clone(),
            message_limit: config.batch_message_limit,
            http_timeout: config.http_timeout,
        })
    }

    /// Run one full batch. Only a tenant-roster failure is a hard error.
    pub fn run(&self) -> Result<BatchRunResult, PipelineError> {
        let tenants = self.tenant_store.list_automation_enabled()?;
        info!("batch run starting over {} tenants", tenants.len());

        let mut results = Vec::with_capacity(tenants.len());
        for tenant in &tenants {
            let result = self.process_tenant(tenant);
            debug!(
                "tenant {} done: {} processed, {} ok, {} errors",
                tenant.tenant_id, result.processed, result.success_count, result.error_count
            );
            results.push(result);
        }

        let batch = BatchRunResult::from_tenant_results(results);
        info!(
            "batch run finished: {} tenants, {} messages, {} ok, {} errors",
            batch.users_processed, batch.total_processed, batch.total_success, batch.total_errors
        );
        Ok(batch)
    }

    fn process_tenant(&self, tenant: &TenantRecord) -> TenantRunResult {
        let mut result = TenantRunResult::new(&tenant.tenant_id);

        let token = match self.token_vault.refresh_if_needed(&tenant.tenant_id) {
            Ok(TokenState::Connected(record)) => record.access_token,
            Ok(TokenState::NotConnected) => {
                debug!("tenant {} has no mailbox connected", tenant.tenant_id);
                result.errors.push("mailbox not connected; skipped".to_string());
                return result;
            }
            Err(err) => {
                warn!("token refresh failed for {}: {}", tenant.tenant_id, err);
                result.error_count += 1;
                result.errors.push(format!("token refresh failed: {err}"));
                return result;
            }
        };

        let session =
            MailboxSession::new(token.as_str(), self.mailbox_api_base.as_str(), self.http_timeout);
        let listing = match session.list_unread(self.message_limit) {
            Ok(listing) => listing,
            Err(err) => {
                warn!("listing unread failed for {}: {}", tenant.tenant_id, err);
                result.error_count += 1;
                result.errors.push(format!("listing unread failed: {err}"));
                return result;
            }
        };

        let context = match self.tenant_store.get_business_context(&tenant.tenant_id) {
            Ok(context) => context,
            Err(err) => {
                warn!(
                    "business context unavailable for {}: {}",
                    tenant.tenant_id, err
                );
                None
            }
        };

        let handle =
            ProviderHandle::new(token.as_str()).with_api_base(self.mailbox_api_base.as_str());
        let mut seen: HashSet<String> = HashSet::new();
        let mut replied_subjects: Vec<String> = Vec::new();

        for message in listing {
            if !seen.insert(message.id.clone()) {
                continue;
            }
            self.process_message(
                tenant,
                &session,
                &handle,
                context.as_ref(),
                &message.id,
                &mut result,
                &mut replied_subjects,
            );
        }

        if !replied_subjects.is_empty() {
            let body = summarize_replies(&replied_subjects);
            if let Err(err) = self
                .notification_store
                .append(&tenant.tenant_id, NOTIFICATION_TITLE, &body)
            {
                warn!("notification write failed for {}: {}", tenant.tenant_id, err);
            }
        }

        result
    }

    #[allow(clippy::too_many_arguments)]
    fn process_message(
        &self,
        tenant: &TenantRecord,
        session: &MailboxSession,
        handle: &ProviderHandle,
        context: Option<&BusinessContext>,
        message_id: &str,
        result: &mut TenantRunResult,
        replied_subjects: &mut Vec<String>,
    ) {
        result.processed += 1;
        let started = Instant::now();

        let message = match session.fetch_full(message_id) {
            Ok(message) => message,
            Err(err) => {
                warn!(
                    "fetch failed for {} message {}: {}",
                    tenant.tenant_id, message_id, err
                );
                result.error_count += 1;
                result.errors.push(format!("message {message_id}: {err}"));
                self.record(NewActivityEntry {
                    tenant_id: tenant.tenant_id.clone(),
                    message_id: message_id.to_string(),
                    action: ActivityAction::Error,
                    confidence: None,
                    response_time_ms: None,
                    success: false,
                    error_message: Some(err.to_string()),
                });
                return;
            }
        };

        let analysis = self
            .classifier
            .analyze(&message, context, &tenant.reply_tone);
        if analysis.fallback {
            warn!(
                "classification fell back for {} message {}",
                tenant.tenant_id, message.id
            );
        }

        match decide(&analysis, tenant.confidence_threshold) {
            Disposition::Skip => {
                debug!("skipping spam message {}", message.id);
                self.record(NewActivityEntry {
                    tenant_id: tenant.tenant_id.clone(),
                    message_id: message.id.clone(),
                    action: ActivityAction::Skipped,
                    confidence: Some(analysis.confidence),
                    response_time_ms: None,
                    success: true,
                    error_message: None,
                });
                result.success_count += 1;
            }
            Disposition::Escalate => {
                debug!(
                    "escalating message {} at confidence {:.2}",
                    message.id, analysis.confidence
                );
                self.record(NewActivityEntry {
                    tenant_id: tenant.tenant_id.clone(),
                    message_id: message.id.clone(),
                    action: ActivityAction::Escalated,
                    confidence: Some(analysis.confidence),
                    response_time_ms: None,
                    success: true,
                    error_message: None,
                });
                result.success_count += 1;
            }
            Disposition::Reply => {
                if self.reply_to(tenant, handle, &message, &analysis, started, result) {
                    replied_subjects.push(message.subject.clone());
                }
            }
        }
    }

    fn reply_to(
        &self,
        tenant: &TenantRecord,
        handle: &ProviderHandle,
        message: &NormalizedMessage,
        analysis: &AnalysisResult,
        started: Instant,
        result: &mut TenantRunResult,
    ) -> bool {
        let reply = ReplyRequest {
            to: message.from.clone(),
            subject: normalize_reply_subject(&message.subject),
            body: analysis.suggested_reply.clone(),
            in_reply_to: message.rfc_message_id.clone(),
            thread_id: Some(message.thread_id.clone()),
        };

        if let Err(err) = send_reply(handle, &reply) {
            warn!(
                "send failed for {} message {}: {}",
                tenant.tenant_id, message.id, err
            );
            result.error_count += 1;
            result
                .errors
                .push(format!("message {}: send failed: {err}", message.id));
            self.record(NewActivityEntry {
                tenant_id: tenant.tenant_id.clone(),
                message_id: message.id.clone(),
                action: ActivityAction::Error,
                confidence: Some(analysis.confidence),
                response_time_ms: None,
                success: false,
                error_message: Some(err.to_string()),
            });
            return false;
        }

        // The reply is already out; a failed mark-as-read only risks one
        // duplicate next run, so it downgrades to a note.
        let mark_note = match mark_processed(handle, &message.id) {
            Ok(()) => None,
            Err(err) => {
                warn!(
                    "mark-as-read failed for {} message {}: {}",
                    tenant.tenant_id, message.id, err
                );
                Some(format!("reply sent; mark-as-read failed: {err}"))
            }
        };

        self.record(NewActivityEntry {
            tenant_id: tenant.tenant_id.clone(),
            message_id: message.id.clone(),
            action: ActivityAction::AutoReplied,
            confidence: Some(analysis.confidence),
            response_time_ms: Some(started.elapsed().as_millis() as i64),
            success: true,
            error_message: mark_note,
        });
        result.success_count += 1;
        true
    }

    fn record(&self, entry: NewActivityEntry) {
        if let Err(err) = self.activity_store.append(entry) {
            warn!("activity write failed: {}", err);
        }
    }
}

/// One consolidated notification body per tenant per run, capped at three
/// subjects.
fn summarize_replies(subjects: &[String]) -> String {
    let shown: Vec<String> = subjects
        .iter()
        .take(NOTIFICATION_SUBJECT_CAP)
        .map(|subject| format!("\"{}\"", subject))
        .collect();
    let mut body = format!(
        "Auto-replied to {} message{}: {}",
        subjects.len(),
        if subjects.len() == 1 { "" } else { "s" },
        shown.join(", ")
    );
    if subjects.len() > NOTIFICATION_SUBJECT_CAP {
        body.push_str(&format!(
            " (+{} more)",
            subjects.len() - NOTIFICATION_SUBJECT_CAP
        ));
    }
    body
}
