//! Outbound reply dispatch for the mailbox automation pipeline.
//!
//! Assembles a minimal RFC 2822 reply, transport-encodes it as URL-safe
//! base64 without padding, submits it through the mailbox provider's send
//! endpoint, and clears the unread state on the source message.

use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::Deserialize;

const DEFAULT_API_BASE: &str = "https://gmail.googleapis.com";
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Credential and endpoint for one mailbox session. Built per tenant by the
/// caller; this crate never caches tokens.
#[derive(Debug, Clone)]
pub struct ProviderHandle {
    pub access_token: String,
    /// Override for the provider base URL; falls back to
    /// `MAILBOX_API_BASE_URL`, then the public endpoint.
    pub api_base: Option<String>,
}

impl ProviderHandle {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            api_base: None,
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = Some(api_base.into());
        self
    }

    fn resolve_api_base(&self) -> String {
        if let Some(base) = self.api_base.as_deref() {
            return base.trim_end_matches('/').to_string();
        }
        dotenvy::dotenv().ok();
        std::env::var("MAILBOX_API_BASE_URL")
            .ok()
            .map(|value| value.trim().trim_end_matches('/').to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string())
    }
}

/// One outgoing reply.
#[derive(Debug, Clone)]
pub struct ReplyRequest {
    pub to: String,
    pub subject: String,
    pub body: String,
    /// Message-ID of the message being answered; also used for References.
    pub in_reply_to: Option<String>,
    /// Provider thread to attach the reply to.
    pub thread_id: Option<String>,
}

/// Provider acknowledgement of a sent reply.
#[derive(Debug, Clone)]
pub struct SendReplyResponse {
    pub message_id: String,
    pub thread_id: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum SendReplyError {
    #[error("http error: {0}")]
    Http(String),
    #[error("provider rejected request: HTTP {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("provider response missing message id")]
    MissingMessageId,
}

#[derive(Debug, Deserialize)]
struct SendMessageResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(rename = "threadId", default)]
    thread_id: Option<String>,
}

/// Prefix a subject with `Re:` exactly once. An existing prefix is kept
/// as-is regardless of case, so replying within a thread never stacks
/// `Re: Re:`.
pub fn normalize_reply_subject(subject: &str) -> String {
    let trimmed = subject.trim();
    if trimmed.to_ascii_lowercase().starts_with("re:") {
        trimmed.to_string()
    } else if trimmed.is_empty() {
        "Re:".to_string()
    } else {
        format!("Re: {}", trimmed)
    }
}

/// Assemble the minimal RFC 2822 envelope for a reply: To, Subject,
/// Content-Type, threading headers, blank line, body.
pub fn build_rfc2822(reply: &ReplyRequest) -> String {
    let mut message = String::new();
    message.push_str(&format!("To: {}\r\n", reply.to));
    message.push_str(&format!(
        "Subject: {}\r\n",
        normalize_reply_subject(&reply.subject)
    ));
    message.push_str("Content-Type: text/plain; charset=utf-8\r\n");
    if let Some(in_reply_to) = reply.in_reply_to.as_deref().filter(|v| !v.trim().is_empty()) {
        message.push_str(&format!("In-Reply-To: {}\r\n", in_reply_to));
        message.push_str(&format!("References: {}\r\n", in_reply_to));
    }
    message.push_str("\r\n");
    message.push_str(&reply.body);
    message
}

/// Transport-encode an assembled message for the provider's `raw` field.
pub fn encode_raw(message: &str) -> String {
    URL_SAFE_NO_PAD.encode(message.as_bytes())
}

/// Send a reply. Returns the provider's id for the new message.
pub fn send_reply(
    handle: &ProviderHandle,
    reply: &ReplyRequest,
) -> Result<SendReplyResponse, SendReplyError> {
    let api_base = handle.resolve_api_base();
    let url = format!("{}/gmail/v1/users/me/messages/send", api_base);

    let raw = encode_raw(&build_rfc2822(reply));
    let mut payload = serde_json::json!({ "raw": raw });
    if let Some(thread_id) = reply.thread_id.as_deref().filter(|v| !v.trim().is_empty()) {
        payload["threadId"] = serde_json::Value::String(thread_id.to_string());
    }

    let client = build_client()?;
    let response = client
        .post(&url)
        .bearer_auth(&handle.access_token)
        .json(&payload)
        .send()
        .map_err(|err| SendReplyError::Http(err.to_string()))?;

    if !response.status().is_success() {
        let status = response.status().as_u16();
        let body = response.text().unwrap_or_default();
        return Err(SendReplyError::Rejected { status, body });
    }

    let parsed: SendMessageResponse = response
        .json()
        .map_err(|err| SendReplyError::Http(err.to_string()))?;
    let message_id = parsed
        .id
        .filter(|id| !id.trim().is_empty())
        .ok_or(SendReplyError::MissingMessageId)?;

    Ok(SendReplyResponse {
        message_id,
        thread_id: parsed.thread_id,
    })
}

/// Clear the unread state on the source message. Callers should treat a
/// failure here as housekeeping noise, not a failed reply: the send already
/// succeeded by the time this runs.
pub fn mark_processed(handle: &ProviderHandle, message_id: &str) -> Result<(), SendReplyError> {
    let api_base = handle.resolve_api_base();
    let url = format!("{}/gmail/v1/users/me/messages/{}/modify", api_base, message_id);

    let client = build_client()?;
    let response = client
        .post(&url)
        .bearer_auth(&handle.access_token)
        .json(&serde_json::json!({ "removeLabelIds": ["UNREAD"] }))
        .send()
        .map_err(|err| SendReplyError::Http(err.to_string()))?;

    if !response.status().is_success() {
        let status = response.status().as_u16();
        let body = response.text().unwrap_or_default();
        return Err(SendReplyError::Rejected { status, body });
    }
    Ok(())
}

fn build_client() -> Result<reqwest::blocking::Client, SendReplyError> {
    reqwest::blocking::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .map_err(|err| SendReplyError::Http(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    fn sample_reply() -> ReplyRequest {
        ReplyRequest {
            to: "alice@example.com".to_string(),
            subject: "Order update".to_string(),
            body: "Thanks for writing in.".to_string(),
            in_reply_to: Some("<msg-1@example.com>".to_string()),
            thread_id: Some("t-1".to_string()),
        }
    }

    #[test]
    fn subject_gains_re_prefix_once() {
        assert_eq!(normalize_reply_subject("Order update"), "Re: Order update");
        assert_eq!(normalize_reply_subject("Re: Order update"), "Re: Order update");
        assert_eq!(normalize_reply_subject("RE: Order update"), "RE: Order update");
        assert_eq!(normalize_reply_subject("  Order update  "), "Re: Order update");
    }

    #[test]
    fn envelope_carries_headers_and_body() {
        let message = build_rfc2822(&sample_reply());
        assert!(message.starts_with("To: alice@example.com\r\n"));
        assert!(message.contains("Subject: Re: Order update\r\n"));
        assert!(message.contains("Content-Type: text/plain; charset=utf-8\r\n"));
        assert!(message.contains("In-Reply-To: <msg-1@example.com>\r\n"));
        assert!(message.contains("References: <msg-1@example.com>\r\n"));
        assert!(message.ends_with("\r\n\r\nThanks for writing in."));
    }

    #[test]
    fn envelope_omits_threading_headers_without_source_id() {
        let mut reply = sample_reply();
        reply.in_reply_to = None;
        let message = build_rfc2822(&reply);
        assert!(!message.contains("In-Reply-To"));
        assert!(!message.contains("References"));
    }

    #[test]
    fn raw_encoding_is_urlsafe_without_padding() {
        let encoded = encode_raw("To: a@b\r\n\r\nhi?>");
        assert!(!encoded.contains('='));
        assert!(!encoded.contains('+'));
        assert!(!encoded.contains('/'));
        let decoded = URL_SAFE_NO_PAD.decode(encoded.as_bytes()).expect("decode");
        assert_eq!(decoded, b"To: a@b\r\n\r\nhi?>");
    }

    #[test]
    fn send_reply_posts_raw_message_and_returns_id() {
        let mut server = Server::new();
        let mock = server
            .mock("POST", "/gmail/v1/users/me/messages/send")
            .match_header("authorization", "Bearer token-123")
            .match_body(Matcher::AllOf(vec![
                Matcher::Regex("\"raw\":".to_string()),
                Matcher::Regex("\"threadId\":\"t-1\"".to_string()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"id":"sent-9","threadId":"t-1"}"#)
            .expect(1)
            .create();

        let handle = ProviderHandle::new("token-123").with_api_base(server.url());
        let response = send_reply(&handle, &sample_reply()).expect("send");
        assert_eq!(response.message_id, "sent-9");
        assert_eq!(response.thread_id.as_deref(), Some("t-1"));
        mock.assert();
    }

    #[test]
    fn send_reply_surfaces_provider_rejection() {
        let mut server = Server::new();
        let _mock = server
            .mock("POST", "/gmail/v1/users/me/messages/send")
            .with_status(403)
            .with_body("insufficient scope")
            .create();

        let handle = ProviderHandle::new("token-123").with_api_base(server.url());
        let err = send_reply(&handle, &sample_reply()).expect_err("rejected");
        match err {
            SendReplyError::Rejected { status, body } => {
                assert_eq!(status, 403);
                assert!(body.contains("insufficient scope"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn mark_processed_removes_unread_label() {
        let mut server = Server::new();
        let mock = server
            .mock("POST", "/gmail/v1/users/me/messages/m-1/modify")
            .match_header("authorization", "Bearer token-123")
            .match_body(Matcher::Regex("\"removeLabelIds\":\\[\"UNREAD\"\\]".to_string()))
            .with_status(200)
            .with_body("{}")
            .expect(1)
            .create();

        let handle = ProviderHandle::new("token-123").with_api_base(server.url());
        mark_processed(&handle, "m-1").expect("mark");
        mock.assert();
    }
}
