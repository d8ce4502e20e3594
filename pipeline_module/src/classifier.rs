//! AI-assisted message classification with a deterministic fallback.
//!
//! One structured prompt per message, embedding the tenant's business
//! context; the model is expected to return a strict JSON object. Anything
//! else — transport failure, non-JSON, hostile enum values, out-of-range
//! confidence — is absorbed: enums coerce to safe defaults, confidence is
//! clamped to [0, 1], and a keyword-derived fallback analysis keeps the
//! pipeline moving when the model is unusable.
//!
//! Configuration mirrors the service config: API URL, key, model name.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::mailbox::NormalizedMessage;
use crate::tenant_store::BusinessContext;

/// Confidence assigned to fallback analyses; deliberately below typical
/// auto-send thresholds so a degraded run escalates instead of replying.
pub const FALLBACK_CONFIDENCE: f64 = 0.5;

/// Raw confidence used when the model returns something non-numeric.
const DEFAULT_RAW_CONFIDENCE: f64 = 0.7;

const MODEL_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_BODY_CHARS: usize = 4000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Inquiry,
    Support,
    Complaint,
    Feedback,
    Spam,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Urgency {
    Low,
    Medium,
    High,
}

impl Category {
    /// Coerce a wire value against the allow-list; anything unrecognized
    /// becomes `Other` so a hostile model response cannot leak downstream.
    pub fn from_wire(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "inquiry" => Self::Inquiry,
            "support" => Self::Support,
            "complaint" => Self::Complaint,
            "feedback" => Self::Feedback,
            "spam" => Self::Spam,
            "other" => Self::Other,
            _ => Self::Other,
        }
    }
}

impl Sentiment {
    pub fn from_wire(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "positive" => Self::Positive,
            "negative" => Self::Negative,
            "neutral" => Self::Neutral,
            _ => Self::Neutral,
        }
    }
}

impl Urgency {
    pub fn from_wire(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "low" => Self::Low,
            "high" => Self::High,
            "medium" => Self::Medium,
            _ => Self::Medium,
        }
    }
}

/// Output of classification for one message. Produced once per message per
/// run; never cached across runs.
#[derive(Debug, Clone)]
pub struct AnalysisResult {
    pub category: Category,
    pub sentiment: Sentiment,
    pub urgency: Urgency,
    pub confidence: f64,
    pub summary: String,
    pub keywords: Vec<String>,
    pub suggested_reply: String,
    /// True when the deterministic fallback produced this result.
    pub fallback: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("http error: {0}")]
    Http(String),
    #[error("model returned HTTP {status}: {body}")]
    Api { status: u16, body: String },
    #[error("model response was not valid JSON: {0}")]
    Json(String),
    #[error("model response was empty")]
    Empty,
}

#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    pub api_url: String,
    pub api_key: Option<String>,
    pub model: String,
}

/// Classifies normalized messages against tenant context.
#[derive(Debug, Clone)]
pub struct Classifier {
    config: ClassifierConfig,
}

impl Classifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self { config }
    }

    /// Classify one message. This never fails: any model problem engages
    /// the deterministic fallback, which is degradation rather than error.
    pub fn analyze(
        &self,
        message: &NormalizedMessage,
        context: Option<&BusinessContext>,
        tone: &str,
    ) -> AnalysisResult {
        let prompt = build_prompt(message, context);
        match self.call_model(&prompt).and_then(|raw| parse_analysis(&raw)) {
            Ok(mut analysis) => {
                if analysis.suggested_reply.trim().is_empty() {
                    analysis.suggested_reply = fallback_reply(message, context, tone);
                }
                analysis
            }
            Err(err) => {
                warn!(
                    "classification degraded for message {}: {}",
                    message.id, err
                );
                fallback_analysis(message, context, tone)
            }
        }
    }

    fn call_model(&self, prompt: &str) -> Result<String, ClassifierError> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or_else(|| ClassifierError::Http("AI API key not configured".to_string()))?;
        let url = format!("{}/chat/completions", self.config.api_url.trim_end_matches('/'));

        let request = ChatRequest {
            model: self.config.model.clone(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            temperature: 0.2,
            max_completion_tokens: 1024,
        };

        debug!("calling model {} at {}", self.config.model, url);
        let client = reqwest::blocking::Client::builder()
            .timeout(MODEL_TIMEOUT)
            .build()
            .map_err(|err| ClassifierError::Http(err.to_string()))?;
        let response = client
            .post(&url)
            .header("Authorization", format!("Bearer {}", api_key))
            .json(&request)
            .send()
            .map_err(|err| ClassifierError::Http(err.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().unwrap_or_default();
            return Err(ClassifierError::Api { status, body });
        }

        let parsed: ChatResponse = response
            .json()
            .map_err(|err| ClassifierError::Http(err.to_string()))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .unwrap_or_default();
        if content.trim().is_empty() {
            return Err(ClassifierError::Empty);
        }
        Ok(content)
    }
}

fn build_prompt(message: &NormalizedMessage, context: Option<&BusinessContext>) -> String {
    let mut prompt = String::new();
    prompt.push_str(
        "You classify customer emails for an inbox automation service. \
         Respond with a single JSON object and nothing else, using exactly \
         these fields:\n\
         {\"type\": one of inquiry|support|complaint|feedback|spam|other,\n \
          \"sentiment\": one of positive|neutral|negative,\n \
          \"urgency\": one of low|medium|high,\n \
          \"confidence\": number between 0 and 1,\n \
          \"summary\": one sentence,\n \
          \"keywords\": up to 5 strings,\n \
          \"suggested_reply\": a complete reply email body}\n\n",
    );

    if let Some(context) = context {
        prompt.push_str(&format!("Business: {}\n", context.name));
        if let Some(industry) = context.industry.as_deref() {
            prompt.push_str(&format!("Industry: {}\n", industry));
        }
        if !context.faq.is_empty() {
            prompt.push_str("FAQ:\n");
            for entry in &context.faq {
                prompt.push_str(&format!("Q: {}\nA: {}\n", entry.question, entry.answer));
            }
        }
        prompt.push('\n');
    }

    let body: String = message.body.chars().take(MAX_BODY_CHARS).collect();
    prompt.push_str(&format!(
        "Email:\nFrom: {}\nSubject: {}\nBody:\n{}\n",
        message.from, message.subject, body
    ));
    prompt
}

/// Parse a model response into an analysis. Markdown code fences are
/// stripped first; field-level coercion keeps every enum inside its
/// allow-list and the confidence inside [0, 1].
pub fn parse_analysis(raw: &str) -> Result<AnalysisResult, ClassifierError> {
    let cleaned = strip_code_fence(raw);
    let value: serde_json::Value =
        serde_json::from_str(cleaned).map_err(|err| ClassifierError::Json(err.to_string()))?;

    let category = value
        .get("type")
        .and_then(|v| v.as_str())
        .map(Category::from_wire)
        .unwrap_or(Category::Other);
    let sentiment = value
        .get("sentiment")
        .and_then(|v| v.as_str())
        .map(Sentiment::from_wire)
        .unwrap_or(Sentiment::Neutral);
    let urgency = value
        .get("urgency")
        .and_then(|v| v.as_str())
        .map(Urgency::from_wire)
        .unwrap_or(Urgency::Medium);
    let confidence = clamp_confidence(extract_confidence(value.get("confidence")));
    let summary = value
        .get("summary")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let keywords = value
        .get("keywords")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str())
                .take(5)
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default();
    let suggested_reply = value
        .get("suggested_reply")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();

    Ok(AnalysisResult {
        category,
        sentiment,
        urgency,
        confidence,
        summary,
        keywords,
        suggested_reply,
        fallback: false,
    })
}

fn extract_confidence(value: Option<&serde_json::Value>) -> f64 {
    match value {
        Some(serde_json::Value::Number(n)) => n.as_f64().unwrap_or(DEFAULT_RAW_CONFIDENCE),
        Some(serde_json::Value::String(s)) => s.trim().parse().unwrap_or(DEFAULT_RAW_CONFIDENCE),
        _ => DEFAULT_RAW_CONFIDENCE,
    }
}

fn clamp_confidence(raw: f64) -> f64 {
    if raw.is_nan() {
        return DEFAULT_RAW_CONFIDENCE;
    }
    raw.clamp(0.0, 1.0)
}

/// Strip a markdown code fence wrapper (```json ... ```), if present.
fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the fence's language tag line, then the closing fence.
    let rest = match rest.split_once('\n') {
        Some((_lang, body)) => body,
        None => rest,
    };
    rest.trim_end().trim_end_matches("```").trim()
}

/// Deterministic keyword-derived analysis used when the model is
/// unavailable or returned unusable output. No network calls.
pub fn fallback_analysis(
    message: &NormalizedMessage,
    context: Option<&BusinessContext>,
    tone: &str,
) -> AnalysisResult {
    let haystack = format!("{} {}", message.subject, message.body).to_lowercase();

    let category = detect_category(&haystack);
    let sentiment = detect_sentiment(&haystack);
    let urgency = detect_urgency(&haystack);

    let keywords = [
        "order", "refund", "invoice", "shipping", "account", "price", "cancel", "support",
    ]
    .iter()
    .filter(|word| haystack.contains(**word))
    .map(|word| word.to_string())
    .collect();

    AnalysisResult {
        category,
        sentiment,
        urgency,
        confidence: FALLBACK_CONFIDENCE,
        summary: format!("Message about: {}", truncate(&message.subject, 80)),
        keywords,
        suggested_reply: fallback_reply(message, context, tone),
        fallback: true,
    }
}

fn detect_category(haystack: &str) -> Category {
    const SPAM: &[&str] = &["unsubscribe", "lottery", "winner", "bitcoin", "viagra", "act now"];
    const COMPLAINT: &[&str] = &["complaint", "unacceptable", "disappointed", "terrible", "worst", "refund"];
    const SUPPORT: &[&str] = &["help", "issue", "problem", "error", "broken", "not working", "bug"];
    const FEEDBACK: &[&str] = &["feedback", "suggestion", "love your", "great service", "thank you"];
    const INQUIRY: &[&str] = &["how much", "price", "pricing", "quote", "availability", "do you", "can you", "?"];

    if SPAM.iter().any(|w| haystack.contains(w)) {
        Category::Spam
    } else if COMPLAINT.iter().any(|w| haystack.contains(w)) {
        Category::Complaint
    } else if SUPPORT.iter().any(|w| haystack.contains(w)) {
        Category::Support
    } else if FEEDBACK.iter().any(|w| haystack.contains(w)) {
        Category::Feedback
    } else if INQUIRY.iter().any(|w| haystack.contains(w)) {
        Category::Inquiry
    } else {
        Category::Other
    }
}

fn detect_sentiment(haystack: &str) -> Sentiment {
    const NEGATIVE: &[&str] = &["angry", "terrible", "worst", "unacceptable", "disappointed", "awful"];
    const POSITIVE: &[&str] = &["thanks", "thank you", "great", "love", "awesome", "excellent"];
    if NEGATIVE.iter().any(|w| haystack.contains(w)) {
        Sentiment::Negative
    } else if POSITIVE.iter().any(|w| haystack.contains(w)) {
        Sentiment::Positive
    } else {
        Sentiment::Neutral
    }
}

fn detect_urgency(haystack: &str) -> Urgency {
    const HIGH: &[&str] = &["urgent", "asap", "immediately", "right away", "emergency"];
    if HIGH.iter().any(|w| haystack.contains(w)) {
        Urgency::High
    } else {
        Urgency::Medium
    }
}

/// Deterministic reply template: same message and tone always produce the
/// same greeting and sign-off structure.
pub fn fallback_reply(
    message: &NormalizedMessage,
    context: Option<&BusinessContext>,
    tone: &str,
) -> String {
    let greeting_word = match tone.trim().to_ascii_lowercase().as_str() {
        "friendly" => "Hi",
        "formal" => "Dear",
        _ => "Hello",
    };
    let recipient = sender_first_name(&message.from).unwrap_or_else(|| "there".to_string());
    let topic = if message.subject.trim().is_empty() {
        "your message".to_string()
    } else {
        format!("\"{}\"", truncate(message.subject.trim(), 80))
    };
    let signer = context
        .map(|c| c.name.clone())
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| "The Support Team".to_string());

    format!(
        "{greeting_word} {recipient},\n\n\
         Thank you for reaching out about {topic}. We have received your \
         message and a member of our team will follow up with you as soon as \
         possible.\n\n\
         Best regards,\n{signer}"
    )
}

/// Pull a usable first name out of a From header like
/// `"Alice Smith <alice@example.com>"`.
fn sender_first_name(from: &str) -> Option<String> {
    let display = from.split('<').next().unwrap_or("").trim().trim_matches('"');
    let candidate = if display.is_empty() {
        // Bare address: use the local part.
        from.trim()
            .trim_matches(|c| c == '<' || c == '>')
            .split('@')
            .next()
            .unwrap_or("")
    } else {
        display.split_whitespace().next().unwrap_or("")
    };
    let cleaned: String = candidate
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '-' || *c == '\'')
        .collect();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

fn truncate(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        value.to_string()
    } else {
        value.chars().take(max_chars).collect()
    }
}

// ============================================================================
// Chat completion wire types
// ============================================================================

#[derive(Debug, Clone, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_completion_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}
