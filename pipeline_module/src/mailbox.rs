//! Mailbox message retrieval, normalized into a pipeline-neutral shape.
//!
//! Listing fetches metadata only; the full body is pulled per message and
//! extracted from a depth-first walk of the (possibly nested) multipart
//! payload, preferring plain text over HTML. Body extraction never fails a
//! message: it degrades to the snippet, then to an empty string.

use std::time::Duration;

use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

/// Per-tenant mailbox session. Constructed at the start of tenant processing
/// and dropped at the end; credentials never outlive the tenant's pass.
#[derive(Debug)]
pub struct MailboxSession {
    access_token: String,
    api_base: String,
    client: reqwest::blocking::Client,
}

/// A mailbox message in pipeline-neutral form. A read-only snapshot for one
/// run; the pipeline never persists it.
#[derive(Debug, Clone)]
pub struct NormalizedMessage {
    pub id: String,
    pub thread_id: String,
    pub from: String,
    pub to: String,
    pub subject: String,
    /// RFC 2822 Message-ID header, used to thread replies.
    pub rfc_message_id: Option<String>,
    pub body: String,
    pub snippet: String,
    pub date: Option<DateTime<Utc>>,
    pub is_unread: bool,
    pub labels: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("http error: {0}")]
    Http(String),
    #[error("provider rejected request: HTTP {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("json error: {0}")]
    Json(String),
}

#[derive(Debug, Deserialize)]
struct MessageListResponse {
    #[serde(default)]
    messages: Vec<MessageRef>,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMessage {
    id: String,
    #[serde(default)]
    thread_id: String,
    #[serde(default)]
    label_ids: Vec<String>,
    #[serde(default)]
    snippet: String,
    #[serde(default)]
    internal_date: Option<String>,
    #[serde(default)]
    payload: Option<WirePart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePart {
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    headers: Vec<WireHeader>,
    #[serde(default)]
    body: Option<WireBody>,
    #[serde(default)]
    parts: Vec<WirePart>,
}

#[derive(Debug, Deserialize)]
struct WireHeader {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct WireBody {
    #[serde(default)]
    data: Option<String>,
}

impl MailboxSession {
    pub fn new(
        access_token: impl Into<String>,
        api_base: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::blocking::Client::new());
        Self {
            access_token: access_token.into(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    /// List unread messages, metadata only. The listing call stays cheap by
    /// never requesting full bodies.
    pub fn list_unread(&self, limit: usize) -> Result<Vec<NormalizedMessage>, MailboxError> {
        let url = format!(
            "{}/gmail/v1/users/me/messages?q=is%3Aunread&maxResults={}",
            self.api_base, limit
        );
        let listing: MessageListResponse = self.get_json(&url)?;
        debug!("listed {} unread message refs", listing.messages.len());

        // One bad ref must not take down the whole listing; only the listing
        // call itself is fatal for the tenant.
        let mut messages = Vec::with_capacity(listing.messages.len());
        for msg_ref in listing.messages.into_iter().take(limit) {
            let url = format!(
                "{}/gmail/v1/users/me/messages/{}?format=metadata",
                self.api_base, msg_ref.id
            );
            match self.get_json::<WireMessage>(&url) {
                Ok(wire) => messages.push(normalize_metadata(wire)),
                Err(err) => warn!("metadata fetch for {} failed, skipping: {}", msg_ref.id, err),
            }
        }
        Ok(messages)
    }

    /// Fetch one message with its full payload and extract the body.
    pub fn fetch_full(&self, message_id: &str) -> Result<NormalizedMessage, MailboxError> {
        let url = format!(
            "{}/gmail/v1/users/me/messages/{}?format=full",
            self.api_base, message_id
        );
        let wire: WireMessage = self.get_json(&url)?;
        Ok(normalize_full(wire))
    }

    fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, MailboxError> {
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.access_token)
            .send()
            .map_err(|err| MailboxError::Http(err.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().unwrap_or_default();
            return Err(MailboxError::Rejected { status, body });
        }

        response
            .json::<T>()
            .map_err(|err| MailboxError::Json(err.to_string()))
    }
}

fn normalize_metadata(wire: WireMessage) -> NormalizedMessage {
    normalize(wire, false)
}

fn normalize_full(wire: WireMessage) -> NormalizedMessage {
    normalize(wire, true)
}

fn normalize(wire: WireMessage, with_body: bool) -> NormalizedMessage {
    let headers = wire
        .payload
        .as_ref()
        .map(|payload| payload.headers.as_slice())
        .unwrap_or(&[]);
    let from = header_value(headers, "From").unwrap_or_default();
    let to = header_value(headers, "To").unwrap_or_default();
    let subject = header_value(headers, "Subject").unwrap_or_default();
    let rfc_message_id = header_value(headers, "Message-ID");

    let body = if with_body {
        extract_body(wire.payload.as_ref(), &wire.snippet)
    } else {
        String::new()
    };

    // Unread is a label-set membership, not a separate flag on the wire.
    let is_unread = wire.label_ids.iter().any(|label| label == "UNREAD");

    NormalizedMessage {
        id: wire.id,
        thread_id: wire.thread_id,
        from,
        to,
        subject,
        rfc_message_id,
        body,
        snippet: wire.snippet,
        date: parse_internal_date(wire.internal_date.as_deref()),
        is_unread,
        labels: wire.label_ids,
    }
}

fn header_value(headers: &[WireHeader], name: &str) -> Option<String> {
    headers
        .iter()
        .find(|header| header.name.eq_ignore_ascii_case(name))
        .map(|header| header.value.clone())
}

fn parse_internal_date(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let millis = raw?.trim().parse::<i64>().ok()?;
    Utc.timestamp_millis_opt(millis).single()
}

/// Pull a text body out of a possibly nested multipart payload. Plain text
/// wins over HTML; an undecodable payload degrades to the snippet, then to
/// an empty string. This never fails the message.
fn extract_body(payload: Option<&WirePart>, snippet: &str) -> String {
    let Some(payload) = payload else {
        return snippet.to_string();
    };
    if let Some(text) = find_part(payload, "text/plain") {
        return text;
    }
    if let Some(html) = find_part(payload, "text/html") {
        return strip_html(&html);
    }
    // Single-part messages carry the body on the payload itself.
    if let Some(data) = payload.body.as_ref().and_then(|body| body.data.as_deref()) {
        if let Some(text) = decode_body_data(data) {
            if payload.mime_type.starts_with("text/html") {
                return strip_html(&text);
            }
            return text;
        }
    }
    snippet.to_string()
}

/// Depth-first search for the first decodable part of the wanted MIME type.
fn find_part(part: &WirePart, mime_type: &str) -> Option<String> {
    if part.mime_type.starts_with(mime_type) {
        if let Some(data) = part.body.as_ref().and_then(|body| body.data.as_deref()) {
            if let Some(text) = decode_body_data(data) {
                return Some(text);
            }
        }
    }
    for child in &part.parts {
        if let Some(text) = find_part(child, mime_type) {
            return Some(text);
        }
    }
    None
}

fn decode_body_data(data: &str) -> Option<String> {
    let bytes = URL_SAFE_NO_PAD
        .decode(data.as_bytes())
        .or_else(|_| URL_SAFE.decode(data.as_bytes()))
        .ok()?;
    String::from_utf8(bytes).ok()
}

/// Minimal tag stripper for the HTML fallback path. Enough to hand the
/// classifier readable text; fidelity is not the goal.
fn strip_html(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(ch),
            _ => {}
        }
    }
    let out = out
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'");
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(text: &str) -> String {
        URL_SAFE_NO_PAD.encode(text.as_bytes())
    }

    fn wire_from_json(value: serde_json::Value) -> WireMessage {
        serde_json::from_value(value).expect("wire message")
    }

    #[test]
    fn plain_text_wins_over_html_in_nested_multipart() {
        let wire = wire_from_json(serde_json::json!({
            "id": "m1",
            "threadId": "t1",
            "labelIds": ["INBOX", "UNREAD"],
            "snippet": "snippet text",
            "payload": {
                "mimeType": "multipart/mixed",
                "headers": [
                    {"name": "From", "value": "Alice <alice@example.com>"},
                    {"name": "Subject", "value": "Hello"},
                    {"name": "Message-ID", "value": "<abc@mail.example.com>"}
                ],
                "parts": [
                    {
                        "mimeType": "multipart/alternative",
                        "parts": [
                            {
                                "mimeType": "text/html",
                                "body": {"data": encoded("<p>html body</p>")}
                            },
                            {
                                "mimeType": "text/plain",
                                "body": {"data": encoded("plain body")}
                            }
                        ]
                    }
                ]
            }
        }));
        let message = normalize_full(wire);
        assert_eq!(message.body, "plain body");
        assert_eq!(message.from, "Alice <alice@example.com>");
        assert_eq!(message.subject, "Hello");
        assert_eq!(
            message.rfc_message_id.as_deref(),
            Some("<abc@mail.example.com>")
        );
        assert!(message.is_unread);
    }

    #[test]
    fn html_only_message_is_stripped_to_text() {
        let wire = wire_from_json(serde_json::json!({
            "id": "m1",
            "threadId": "t1",
            "snippet": "snippet",
            "payload": {
                "mimeType": "text/html",
                "body": {"data": encoded("<div>Hi &amp; welcome<br/>there</div>")}
            }
        }));
        let message = normalize_full(wire);
        assert_eq!(message.body, "Hi & welcome there");
    }

    #[test]
    fn undecodable_body_degrades_to_snippet() {
        let wire = wire_from_json(serde_json::json!({
            "id": "m1",
            "threadId": "t1",
            "snippet": "the snippet",
            "payload": {
                "mimeType": "text/plain",
                "body": {"data": "%%% not base64 %%%"}
            }
        }));
        let message = normalize_full(wire);
        assert_eq!(message.body, "the snippet");
    }

    #[test]
    fn missing_payload_and_snippet_degrades_to_empty() {
        let wire = wire_from_json(serde_json::json!({
            "id": "m1",
            "threadId": "t1"
        }));
        let message = normalize_full(wire);
        assert_eq!(message.body, "");
        assert!(!message.is_unread);
    }

    #[test]
    fn unread_is_a_label_membership_check() {
        let read = wire_from_json(serde_json::json!({
            "id": "m1", "threadId": "t1", "labelIds": ["INBOX"]
        }));
        assert!(!normalize_metadata(read).is_unread);

        let unread = wire_from_json(serde_json::json!({
            "id": "m2", "threadId": "t1", "labelIds": ["INBOX", "UNREAD"]
        }));
        assert!(normalize_metadata(unread).is_unread);
    }

    #[test]
    fn internal_date_parses_epoch_millis() {
        let wire = wire_from_json(serde_json::json!({
            "id": "m1",
            "threadId": "t1",
            "internalDate": "1721995200000"
        }));
        let message = normalize_metadata(wire);
        let date = message.date.expect("date");
        assert_eq!(date.timestamp_millis(), 1_721_995_200_000);
    }

    #[test]
    fn padded_base64_still_decodes() {
        let padded = URL_SAFE.encode("padded body".as_bytes());
        assert!(padded.contains('='));
        assert_eq!(decode_body_data(&padded).as_deref(), Some("padded body"));
    }

    #[test]
    fn failing_metadata_fetch_skips_that_ref_only() {
        let mut server = mockito::Server::new();
        let session = MailboxSession::new(
            "tok",
            server.url(),
            std::time::Duration::from_secs(5),
        );

        let _listing = server
            .mock("GET", "/gmail/v1/users/me/messages")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(r#"{"messages": [{"id": "m1"}, {"id": "m2"}]}"#)
            .create();
        let _good = server
            .mock("GET", "/gmail/v1/users/me/messages/m1")
            .match_query(mockito::Matcher::UrlEncoded(
                "format".into(),
                "metadata".into(),
            ))
            .with_status(200)
            .with_body(
                serde_json::json!({"id": "m1", "threadId": "t1", "labelIds": ["UNREAD"]})
                    .to_string(),
            )
            .create();
        let _bad = server
            .mock("GET", "/gmail/v1/users/me/messages/m2")
            .match_query(mockito::Matcher::UrlEncoded(
                "format".into(),
                "metadata".into(),
            ))
            .with_status(500)
            .with_body("backend unavailable")
            .create();

        let messages = session.list_unread(10).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, "m1");
    }
}
