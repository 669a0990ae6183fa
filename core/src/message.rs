/// Message envelope shared by every transport.
///
/// The wire shape is a flat JSON record (`from`, `to`, `payload`, `timestamp`,
/// `id`) with optional request/response fields (`type`, `requestId`, `result`,
/// `error`). The bridge never interprets `payload`.
use chrono::{Local, TimeZone};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

static MESSAGE_SEQ: AtomicU64 = AtomicU64::new(0);

/// Generate a message id: epoch millis, a process-wide sequence number and
/// a random suffix. Two ids from the same process never collide; ids from
/// different processes collide only if the random suffix does.
pub fn generate_message_id() -> String {
    let seq = MESSAGE_SEQ.fetch_add(1, Ordering::Relaxed);
    let random = Uuid::new_v4().simple().to_string();
    format!(
        "msg-{:x}-{:x}-{}",
        now_millis(),
        seq,
        random.get(..8).unwrap_or(&random)
    )
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Request/response tag carried in the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    Request,
    Response,
}

/// Unit of communication between bridge instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Sender identity
    pub from: String,
    /// Recipient identity (already resolved to a container name)
    pub to: String,
    /// Opaque payload: a JSON string for free text, any JSON value otherwise
    pub payload: Value,
    timestamp: i64,
    id: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    kind: Option<EnvelopeKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<Value>,
}

impl Message {
    /// Create a plain message with a freshly generated id.
    pub fn new(from: impl Into<String>, to: impl Into<String>, payload: impl Into<Value>) -> Self {
        Self::with_id(generate_message_id(), from, to, payload)
    }

    /// Create a plain message with a caller-supplied id.
    pub fn with_id(
        id: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
        payload: impl Into<Value>,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            payload: payload.into(),
            timestamp: now_millis(),
            id: id.into(),
            kind: None,
            request_id: None,
            result: None,
            error: None,
        }
    }

    /// Create a request. The request id doubles as the message id so the
    /// request and its eventual response share it.
    pub fn request(
        request_id: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
        action: &str,
        data: Value,
    ) -> Self {
        let request_id = request_id.into();
        let payload = serde_json::json!({ "action": action, "data": data });
        let mut message = Self::with_id(request_id.clone(), from, to, payload);
        message.kind = Some(EnvelopeKind::Request);
        message.request_id = Some(request_id);
        message
    }

    /// Create the response to `original`, addressed back to its sender.
    /// Returns `None` if `original` is not a request.
    pub fn response_to(
        original: &Message,
        from: impl Into<String>,
        result: Option<Value>,
        error: Option<Value>,
    ) -> Option<Self> {
        let request_id = original.request_id()?.to_string();
        let mut message = Self::with_id(
            request_id.clone(),
            from,
            original.from.clone(),
            Value::Null,
        );
        message.kind = Some(EnvelopeKind::Response);
        message.request_id = Some(request_id);
        message.result = result;
        message.error = error;
        Some(message)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Creation time in epoch milliseconds.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn kind(&self) -> Option<EnvelopeKind> {
        self.kind
    }

    /// Correlation id, present only on requests and responses.
    pub fn request_id(&self) -> Option<&str> {
        if self.kind.is_some() {
            self.request_id.as_deref()
        } else {
            None
        }
    }

    pub fn is_request(&self) -> bool {
        self.kind == Some(EnvelopeKind::Request) && self.request_id.is_some()
    }

    pub fn is_response(&self) -> bool {
        self.kind == Some(EnvelopeKind::Response) && self.request_id.is_some()
    }

    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    pub fn error(&self) -> Option<&Value> {
        self.error.as_ref()
    }

    /// Action name of a request payload.
    pub fn action(&self) -> Option<&str> {
        self.payload.get("action").and_then(Value::as_str)
    }

    /// Serialize to a single JSON line (no embedded newlines).
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// Payload as display text: strings verbatim, other values pretty-printed.
    pub fn payload_text(&self) -> String {
        match &self.payload {
            Value::String(text) => text.clone(),
            Value::Null => match (&self.result, &self.error) {
                (_, Some(error)) => format!("error: {}", error),
                (Some(result), None) => format!("result: {}", result),
                (None, None) => String::new(),
            },
            other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
        }
    }
}

/// Drop every control character except newline and tab, so text written to
/// a terminal cannot move the cursor, change modes or inject escape sequences.
pub fn sanitize_terminal_text(text: &str) -> String {
    text.chars()
        .filter(|c| *c == '\n' || *c == '\t' || !c.is_control())
        .collect()
}

/// Render a message as a framed, human-readable block safe to write to a
/// raw terminal. Lines end with CRLF.
pub fn render_terminal_block(message: &Message) -> String {
    let when = Local
        .timestamp_millis_opt(message.timestamp())
        .single()
        .map(|t| t.format("%H:%M:%S").to_string())
        .unwrap_or_else(|| message.timestamp().to_string());

    let from = sanitize_terminal_text(&message.from);
    let to = sanitize_terminal_text(&message.to);
    let body = sanitize_terminal_text(&message.payload_text());

    let mut block = String::from("\r\n");
    block.push_str(&format!("+-- message from {} to {} at {} --\r\n", from, to, when));
    for line in body.lines() {
        block.push_str("| ");
        block.push_str(line);
        block.push_str("\r\n");
    }
    block.push_str(&format!("+-- id {} --\r\n", sanitize_terminal_text(message.id())));
    block
}

/// Quote a string for a POSIX shell using single quotes.
pub fn shell_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r"'\''"))
}
