//! Message model and stream entry codec.
//!
//! A message is immutable once sent: the retry path builds a successor
//! instance with an incremented retry count instead of mutating in place.
//! On the wire each message is a flat list of string field pairs
//! (`id`, `payload`, `priority`, `headers`, `timestamp`, `retryCount`,
//! `maxRetries`, `source`, `traceId`) so entries stay readable with
//! plain `XRANGE` from redis-cli.

use crate::error::QueueError;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Default priority for messages that do not set one.
pub const DEFAULT_PRIORITY: u8 = 5;
/// Highest priority tier.
pub const MAX_PRIORITY: u8 = 9;
/// Default per-message retry budget.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Header recording when the last retry was scheduled (ms epoch).
pub const HEADER_LAST_RETRY_AT: &str = "lastRetryAt";
/// Header recording why the last retry was scheduled.
pub const HEADER_RETRY_REASON: &str = "retryReason";

/// A payload-bearing queue message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Opaque message id, generated when the producer does not assign one.
    pub id: String,

    /// Caller payload, stored as a JSON blob.
    pub payload: serde_json::Value,

    /// Priority tier, 0 (lowest) to 9 (highest).
    pub priority: u8,

    /// Free-form string headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Creation time, ms since the epoch.
    pub timestamp: i64,

    /// Number of times this message has been re-enqueued after a failure.
    #[serde(default)]
    pub retry_count: u32,

    /// Per-message retry budget.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delivery delay in milliseconds; producer-only, never stored on a stream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,

    /// Origin tag.
    #[serde(default)]
    pub source: String,

    /// Optional correlation id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl Message {
    /// Create a message with defaults around the given payload.
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            payload,
            priority: DEFAULT_PRIORITY,
            headers: HashMap::new(),
            timestamp: Utc::now().timestamp_millis(),
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            delay_ms: None,
            source: String::new(),
            trace_id: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = Some(delay_ms);
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Validate the message against the send contract.
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.payload.is_null() {
            return Err(QueueError::Validation("payload is required".to_string()));
        }
        if self.priority > MAX_PRIORITY {
            return Err(QueueError::Validation(format!(
                "priority {} out of range 0..=9",
                self.priority
            )));
        }
        Ok(())
    }

    /// Build the successor message for a retry.
    ///
    /// Keeps the logical id and payload, bumps the retry count, and records
    /// the retry bookkeeping headers.
    pub fn into_retry(&self, reason: &str) -> Self {
        let mut next = self.clone();
        next.retry_count = self.retry_count + 1;
        next.delay_ms = None;
        next.headers.insert(
            HEADER_LAST_RETRY_AT.to_string(),
            Utc::now().timestamp_millis().to_string(),
        );
        next.headers
            .insert(HEADER_RETRY_REASON.to_string(), reason.to_string());
        next
    }

    /// Encode into flat stream entry fields.
    pub fn to_fields(&self) -> Result<Vec<(&'static str, String)>, QueueError> {
        let mut fields = vec![
            ("id", self.id.clone()),
            ("payload", serde_json::to_string(&self.payload)?),
            ("priority", self.priority.to_string()),
            ("headers", serde_json::to_string(&self.headers)?),
            ("timestamp", self.timestamp.to_string()),
            ("retryCount", self.retry_count.to_string()),
            ("maxRetries", self.max_retries.to_string()),
            ("source", self.source.clone()),
        ];
        if let Some(trace_id) = &self.trace_id {
            fields.push(("traceId", trace_id.clone()));
        }
        Ok(fields)
    }

    /// Decode a stream entry back into a message.
    ///
    /// Missing numeric fields fall back to their defaults (priority 5,
    /// maxRetries 3, retryCount 0) so entries written by older producers
    /// stay readable.
    pub fn from_fields(map: &HashMap<String, redis::Value>) -> Result<Self, QueueError> {
        let id = field_str(map, "id")
            .ok_or_else(|| QueueError::Deserialization("missing 'id' field".to_string()))?;
        let payload_raw = field_str(map, "payload")
            .ok_or_else(|| QueueError::Deserialization("missing 'payload' field".to_string()))?;
        let payload: serde_json::Value = serde_json::from_str(&payload_raw)
            .map_err(|e| QueueError::Deserialization(format!("bad payload JSON: {e}")))?;

        let headers: HashMap<String, String> = match field_str(map, "headers") {
            Some(raw) => serde_json::from_str(&raw)
                .map_err(|e| QueueError::Deserialization(format!("bad headers JSON: {e}")))?,
            None => HashMap::new(),
        };

        Ok(Self {
            id,
            payload,
            priority: field_parse(map, "priority").unwrap_or(DEFAULT_PRIORITY),
            headers,
            timestamp: field_parse(map, "timestamp").unwrap_or_else(|| Utc::now().timestamp_millis()),
            retry_count: field_parse(map, "retryCount").unwrap_or(0),
            max_retries: field_parse(map, "maxRetries").unwrap_or(DEFAULT_MAX_RETRIES),
            delay_ms: None,
            source: field_str(map, "source").unwrap_or_default(),
            trace_id: field_str(map, "traceId"),
        })
    }
}

/// Per-call overrides merged over a message before sending. Options win.
#[derive(Debug, Clone, Default)]
pub struct MessageOptions {
    pub priority: Option<u8>,
    pub delay_ms: Option<u64>,
    pub headers: Option<HashMap<String, String>>,
    pub max_retries: Option<u32>,
    pub trace_id: Option<String>,
}

impl MessageOptions {
    /// Apply these options on top of a message.
    pub fn apply(&self, mut message: Message) -> Message {
        if let Some(priority) = self.priority {
            message.priority = priority;
        }
        if let Some(delay_ms) = self.delay_ms {
            message.delay_ms = Some(delay_ms);
        }
        if let Some(headers) = &self.headers {
            message.headers.extend(headers.clone());
        }
        if let Some(max_retries) = self.max_retries {
            message.max_retries = max_retries;
        }
        if let Some(trace_id) = &self.trace_id {
            message.trace_id = Some(trace_id.clone());
        }
        message
    }
}

/// Outcome of a send.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendResult {
    /// Logical message id.
    pub message_id: String,
    /// Stream entry id assigned by Redis; absent for delayed or failed sends.
    pub redis_message_id: Option<String>,
    /// When the send was performed, ms epoch.
    pub timestamp: i64,
    pub success: bool,
    /// True when the message was staged in the delayed set instead.
    pub delayed: bool,
    /// For delayed sends, when the message becomes due (ms epoch).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execute_at: Option<i64>,
    /// Per-slot error for failed batch slots.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SendResult {
    pub(crate) fn appended(message_id: String, redis_id: String) -> Self {
        Self {
            message_id,
            redis_message_id: Some(redis_id),
            timestamp: Utc::now().timestamp_millis(),
            success: true,
            delayed: false,
            execute_at: None,
            error: None,
        }
    }

    pub(crate) fn staged(message_id: String, execute_at: i64) -> Self {
        Self {
            message_id,
            redis_message_id: None,
            timestamp: Utc::now().timestamp_millis(),
            success: true,
            delayed: true,
            execute_at: Some(execute_at),
            error: None,
        }
    }

    pub(crate) fn failed(message_id: String, error: String) -> Self {
        Self {
            message_id,
            redis_message_id: None,
            timestamp: Utc::now().timestamp_millis(),
            success: false,
            delayed: false,
            execute_at: None,
            error: Some(error),
        }
    }
}

/// A message that exhausted processing and landed on a dead-letter stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterMessage {
    #[serde(flatten)]
    pub message: Message,
    /// Queue the message failed on.
    pub original_queue: String,
    /// Why processing gave up.
    pub failure_reason: String,
    /// When the message was dead-lettered, ms epoch.
    pub failed_at: i64,
    /// Total processing attempts consumed.
    pub attempts: u32,
    /// Set when the entry was re-enqueued from another DLQ entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reprocessed_from: Option<String>,
}

impl DeadLetterMessage {
    /// Encode into stream entry fields: the base message fields plus the
    /// dead-letter metadata.
    pub fn to_fields(&self) -> Result<Vec<(&'static str, String)>, QueueError> {
        let mut fields = self.message.to_fields()?;
        fields.push(("originalQueue", self.original_queue.clone()));
        fields.push(("failureReason", self.failure_reason.clone()));
        fields.push(("failedAt", self.failed_at.to_string()));
        fields.push(("attempts", self.attempts.to_string()));
        if let Some(from) = &self.reprocessed_from {
            fields.push(("reprocessedFrom", from.clone()));
        }
        Ok(fields)
    }

    /// Decode a dead-letter stream entry.
    pub fn from_fields(map: &HashMap<String, redis::Value>) -> Result<Self, QueueError> {
        let message = Message::from_fields(map)?;
        let attempts = field_parse(map, "attempts").unwrap_or(message.retry_count + 1);
        Ok(Self {
            original_queue: field_str(map, "originalQueue").unwrap_or_default(),
            failure_reason: field_str(map, "failureReason").unwrap_or_default(),
            failed_at: field_parse(map, "failedAt").unwrap_or(message.timestamp),
            attempts,
            reprocessed_from: field_str(map, "reprocessedFrom"),
            message,
        })
    }
}

/// Extract a string field from a stream entry map.
fn field_str(map: &HashMap<String, redis::Value>, key: &str) -> Option<String> {
    match map.get(key)? {
        redis::Value::BulkString(bytes) => Some(String::from_utf8_lossy(bytes).to_string()),
        redis::Value::SimpleString(s) => Some(s.clone()),
        redis::Value::Int(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Extract and parse a numeric field, `None` on absence or parse failure.
fn field_parse<T: std::str::FromStr>(map: &HashMap<String, redis::Value>, key: &str) -> Option<T> {
    field_str(map, key)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry_map(fields: &[(&str, &str)]) -> HashMap<String, redis::Value> {
        fields
            .iter()
            .map(|(k, v)| {
                (
                    k.to_string(),
                    redis::Value::BulkString(v.as_bytes().to_vec()),
                )
            })
            .collect()
    }

    #[test]
    fn test_new_message_defaults() {
        let msg = Message::new(json!({"kind": "email"}));
        assert_eq!(msg.priority, 5);
        assert_eq!(msg.retry_count, 0);
        assert_eq!(msg.max_retries, 3);
        assert!(msg.delay_ms.is_none());
        assert!(!msg.id.is_empty());
    }

    #[test]
    fn test_validation_rejects_null_payload() {
        let msg = Message::new(serde_json::Value::Null);
        assert!(matches!(msg.validate(), Err(QueueError::Validation(_))));
    }

    #[test]
    fn test_validation_rejects_priority_out_of_range() {
        let msg = Message::new(json!(1)).with_priority(10);
        assert!(matches!(msg.validate(), Err(QueueError::Validation(_))));

        let msg = Message::new(json!(1)).with_priority(9);
        assert!(msg.validate().is_ok());
    }

    #[test]
    fn test_fields_round_trip() {
        let msg = Message::new(json!({"to": "u@x", "type": "email"}))
            .with_priority(7)
            .with_header("tenant", "acme")
            .with_source("api")
            .with_trace_id("trace-1");

        let fields = msg.to_fields().unwrap();
        let map: HashMap<String, redis::Value> = fields
            .into_iter()
            .map(|(k, v)| (k.to_string(), redis::Value::BulkString(v.into_bytes())))
            .collect();

        let decoded = Message::from_fields(&map).unwrap();
        assert_eq!(decoded.id, msg.id);
        assert_eq!(decoded.payload, msg.payload);
        assert_eq!(decoded.priority, 7);
        assert_eq!(decoded.headers.get("tenant").unwrap(), "acme");
        assert_eq!(decoded.source, "api");
        assert_eq!(decoded.trace_id.as_deref(), Some("trace-1"));
        assert_eq!(decoded.retry_count, 0);
    }

    #[test]
    fn test_decode_restores_defaults() {
        let map = entry_map(&[("id", "m-1"), ("payload", "{\"a\":1}")]);
        let decoded = Message::from_fields(&map).unwrap();
        assert_eq!(decoded.priority, 5);
        assert_eq!(decoded.max_retries, 3);
        assert_eq!(decoded.retry_count, 0);
        assert!(decoded.headers.is_empty());
    }

    #[test]
    fn test_decode_missing_payload_fails() {
        let map = entry_map(&[("id", "m-1")]);
        assert!(matches!(
            Message::from_fields(&map),
            Err(QueueError::Deserialization(_))
        ));
    }

    #[test]
    fn test_into_retry_bumps_count_and_headers() {
        let msg = Message::new(json!({"a": 1}));
        let retry = msg.into_retry("boom");
        assert_eq!(retry.retry_count, 1);
        assert_eq!(retry.id, msg.id);
        assert_eq!(retry.payload, msg.payload);
        assert_eq!(retry.headers.get(HEADER_RETRY_REASON).unwrap(), "boom");
        assert!(retry.headers.contains_key(HEADER_LAST_RETRY_AT));
        // original untouched
        assert_eq!(msg.retry_count, 0);
    }

    #[test]
    fn test_options_win_over_message() {
        let msg = Message::new(json!(1)).with_priority(2);
        let opts = MessageOptions {
            priority: Some(8),
            delay_ms: Some(500),
            ..Default::default()
        };
        let merged = opts.apply(msg);
        assert_eq!(merged.priority, 8);
        assert_eq!(merged.delay_ms, Some(500));
    }

    #[test]
    fn test_dead_letter_round_trip() {
        let msg = Message::new(json!({"x": 2})).with_priority(3);
        let dlm = DeadLetterMessage {
            message: msg.clone(),
            original_queue: "orders".to_string(),
            failure_reason: "max_retries_exceeded".to_string(),
            failed_at: 1_700_000_000_000,
            attempts: 3,
            reprocessed_from: None,
        };

        let fields = dlm.to_fields().unwrap();
        let map: HashMap<String, redis::Value> = fields
            .into_iter()
            .map(|(k, v)| (k.to_string(), redis::Value::BulkString(v.into_bytes())))
            .collect();

        let decoded = DeadLetterMessage::from_fields(&map).unwrap();
        assert_eq!(decoded.original_queue, "orders");
        assert_eq!(decoded.failure_reason, "max_retries_exceeded");
        assert_eq!(decoded.attempts, 3);
        assert_eq!(decoded.message.id, msg.id);
        assert_eq!(decoded.message.priority, 3);
    }
}
