//! Message model and the projections copied out of received messages.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Custom property that carries the W3C trace parent of a message.
pub const TRACE_PARENT_PROPERTY: &str = "Diagnostic-Id";

/// Number of characters kept in a search match preview.
pub const PREVIEW_CHARS: usize = 300;

/// Which half of a queue a receiver is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SubQueue {
    Main,
    DeadLetter,
}

impl SubQueue {
    /// Label used in logs and reports.
    pub fn label(&self) -> &'static str {
        match self {
            SubQueue::Main => "main queue",
            SubQueue::DeadLetter => "dead letter queue",
        }
    }
}

impl fmt::Display for SubQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Message body, resolved once when the message is received.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
    Structured(serde_json::Value),
}

impl Payload {
    /// Body as text: binary is decoded as UTF-8, structured is serialized as JSON.
    pub fn as_text(&self) -> Cow<'_, str> {
        match self {
            Payload::Text(text) => Cow::Borrowed(text),
            Payload::Binary(bytes) => String::from_utf8_lossy(bytes),
            Payload::Structured(value) => Cow::Owned(value.to_string()),
        }
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Payload::Text(value.to_string())
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Payload::Text(value)
    }
}

/// Failure metadata stamped on messages that were dead-lettered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterInfo {
    pub reason: Option<String>,
    pub error_description: Option<String>,
}

/// A message fetched from a sub-queue.
///
/// Received messages carry a `lock_token` and can be deleted; peeked messages
/// are read-only snapshots and never do.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    pub message_id: String,
    /// Strictly increasing per sub-queue
    pub sequence_number: u64,
    pub body: Payload,
    pub content_type: Option<String>,
    pub subject: Option<String>,
    pub correlation_id: Option<String>,
    pub session_id: Option<String>,
    pub reply_to: Option<String>,
    pub to: Option<String>,
    pub partition_key: Option<String>,
    pub time_to_live: Option<Duration>,
    pub properties: BTreeMap<String, serde_json::Value>,
    pub enqueued_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub dead_letter: Option<DeadLetterInfo>,
    pub lock_token: Option<String>,
}

impl Default for Payload {
    fn default() -> Self {
        Payload::Text(String::new())
    }
}

/// Ordered messages returned by one fetch. Empty means end of stream.
pub type Batch = Vec<Message>;

/// Fields copied from a source message into the message forwarded to the
/// destination queue.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub message_id: String,
    pub body: Payload,
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
    pub subject: Option<String>,
    pub properties: BTreeMap<String, serde_json::Value>,
    pub to: Option<String>,
    pub reply_to: Option<String>,
    pub session_id: Option<String>,
    pub time_to_live: Option<Duration>,
}

impl From<&Message> for OutboundMessage {
    fn from(m: &Message) -> Self {
        Self {
            message_id: m.message_id.clone(),
            body: m.body.clone(),
            content_type: m.content_type.clone(),
            correlation_id: m.correlation_id.clone(),
            subject: m.subject.clone(),
            properties: m.properties.clone(),
            to: m.to.clone(),
            reply_to: m.reply_to.clone(),
            session_id: m.session_id.clone(),
            time_to_live: m.time_to_live,
        }
    }
}

/// Read-only export record produced by a snapshot run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSnapshot {
    pub message_id: String,
    pub sequence_number: u64,
    pub body: Payload,
    pub subject: Option<String>,
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
    pub partition_key: Option<String>,
    pub trace_parent: Option<serde_json::Value>,
    pub application_properties: BTreeMap<String, serde_json::Value>,
    pub enqueued_time_utc: Option<DateTime<Utc>>,
    pub expires_at_utc: Option<DateTime<Utc>>,
    pub dead_letter_reason: Option<String>,
    pub dead_letter_error_description: Option<String>,
    #[serde(rename = "_source")]
    pub source: SubQueue,
}

impl MessageSnapshot {
    pub fn capture(message: &Message, source: SubQueue) -> Self {
        let dead_letter = message.dead_letter.clone().unwrap_or_default();
        Self {
            message_id: message.message_id.clone(),
            sequence_number: message.sequence_number,
            body: message.body.clone(),
            subject: message.subject.clone(),
            content_type: message.content_type.clone(),
            correlation_id: message.correlation_id.clone(),
            partition_key: message.partition_key.clone(),
            trace_parent: message.properties.get(TRACE_PARENT_PROPERTY).cloned(),
            application_properties: message.properties.clone(),
            enqueued_time_utc: message.enqueued_at,
            expires_at_utc: message.expires_at,
            dead_letter_reason: dead_letter.reason,
            dead_letter_error_description: dead_letter.error_description,
            source,
        }
    }
}

/// A message whose body contained the search pattern.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchMatch {
    /// 1-based position of this match within its run
    pub ordinal: u64,
    pub message_id: String,
    pub sequence_number: u64,
    pub enqueued_at: Option<DateTime<Utc>>,
    pub dead_letter: Option<DeadLetterInfo>,
    pub preview: String,
    pub source: SubQueue,
}

/// First [`PREVIEW_CHARS`] characters of `text`, with `...` appended when cut.
pub fn preview(text: &str) -> String {
    match text.char_indices().nth(PREVIEW_CHARS) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}
