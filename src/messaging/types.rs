//! Message types flowing through the bus.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

/// Message categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Category {
    /// Fire-and-forget event.
    Notice,
    /// Unified command, may or may not expect a reply.
    Intent,
    /// Command expecting a structured reply.
    IntentRequest,
    /// Reply correlated to a prior request.
    IntentResponse,
}

impl Category {
    pub const ALL: [Category; 4] = [
        Category::Notice,
        Category::Intent,
        Category::IntentRequest,
        Category::IntentResponse,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Notice => "Notice",
            Category::Intent => "Intent",
            Category::IntentRequest => "IntentRequest",
            Category::IntentResponse => "IntentResponse",
        }
    }

    /// Whether this category carries an intent name as its routing key.
    pub fn is_intent(&self) -> bool {
        matches!(self, Category::Intent | Category::IntentRequest)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

static LAST_TIMESTAMP_MS: AtomicI64 = AtomicI64::new(0);

/// Current time in milliseconds, never lower than a previously returned value.
pub fn monotonic_now() -> DateTime<Utc> {
    let now = Utc::now().timestamp_millis();
    let prev = LAST_TIMESTAMP_MS.fetch_max(now, Ordering::SeqCst);
    let millis = prev.max(now);
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or_else(Utc::now)
}

/// A message on the bus.
///
/// Fields are private: a message is built with the constructors and
/// `with_*` methods, then handed to the bus, after which nobody mutates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub struct Message {
    #[serde(default)]
    id: String,
    #[serde(default)]
    category: Option<Category>,
    /// `event_name` for notices, intent name for intents, action for responses.
    #[serde(default)]
    topic: String,
    #[serde(default)]
    payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    source: Option<String>,
    #[serde(default = "monotonic_now")]
    timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parallel_safe: Option<bool>,
}

impl Message {
    /// Create a message of the given category and routing key.
    pub fn new(category: Category, topic: impl Into<String>, payload: Value) -> Self {
        Self {
            id: new_message_id(),
            category: Some(category),
            topic: topic.into(),
            payload,
            correlation_id: None,
            source: None,
            timestamp: monotonic_now(),
            parallel_safe: None,
        }
    }

    /// Create a notice ("something happened").
    pub fn notice(event_name: impl Into<String>, payload: Value) -> Self {
        Self::new(Category::Notice, event_name, payload)
    }

    /// Create a unified intent.
    pub fn intent(name: impl Into<String>, payload: Value) -> Self {
        Self::new(Category::Intent, name, payload)
    }

    /// Create an intent that expects a structured reply.
    pub fn intent_request(name: impl Into<String>, payload: Value) -> Self {
        Self::new(Category::IntentRequest, name, payload)
    }

    /// Create a response correlated to a prior request.
    pub fn intent_response(
        action: impl Into<String>,
        correlation_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self::new(Category::IntentResponse, action, payload).with_correlation_id(correlation_id)
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Declare this message safe for concurrent batch delivery.
    pub fn parallel_safe(mut self) -> Self {
        self.parallel_safe = Some(true);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn category(&self) -> Option<Category> {
        self.category
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn is_parallel_safe(&self) -> bool {
        self.parallel_safe == Some(true)
    }

    /// Check the routing fields. Returns the reason on failure.
    pub fn validate(&self) -> Result<Category, &'static str> {
        let category = self.category.ok_or("missing category")?;
        if self.topic.trim().is_empty() {
            return Err("missing routing key");
        }
        Ok(category)
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// Short single-line form for logs.
    pub fn to_log_string(&self) -> String {
        let category = self.category.map(|c| c.as_str()).unwrap_or("?");
        let mut payload = self.payload.to_string();
        if payload.len() > 50 {
            let cut = (0..=50).rev().find(|i| payload.is_char_boundary(*i)).unwrap_or(0);
            payload.truncate(cut);
            payload.push_str("...");
        }
        format!("{}[{}]: {}", category, self.topic, payload)
    }
}

fn new_message_id() -> String {
    format!("msg_{}", uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_notice_constructor() {
        let msg = Message::notice("test.ping", json!({"n": 1}));
        assert_eq!(msg.category(), Some(Category::Notice));
        assert_eq!(msg.topic(), "test.ping");
        assert_eq!(msg.payload()["n"], 1);
        assert!(msg.id().starts_with("msg_"));
        assert!(msg.is_valid());
    }

    #[test]
    fn test_intent_response_carries_correlation() {
        let msg = Message::intent_response("system.stats", "corr-1", json!({}));
        assert_eq!(msg.category(), Some(Category::IntentResponse));
        assert_eq!(msg.correlation_id(), Some("corr-1"));
    }

    #[test]
    fn test_default_message_is_invalid() {
        let msg = Message::default();
        assert_eq!(msg.validate(), Err("missing category"));
    }

    #[test]
    fn test_blank_topic_is_invalid() {
        let msg = Message::notice("   ", Value::Null);
        assert_eq!(msg.validate(), Err("missing routing key"));
    }

    #[test]
    fn test_parallel_safe_flag() {
        let msg = Message::notice("a", Value::Null);
        assert!(!msg.is_parallel_safe());
        assert!(msg.parallel_safe().is_parallel_safe());
    }

    #[test]
    fn test_timestamps_never_decrease() {
        let mut last = monotonic_now();
        for _ in 0..1000 {
            let next = Message::notice("tick", Value::Null).timestamp();
            assert!(next >= last);
            last = next;
        }
    }

    #[test]
    fn test_empty_json_deserializes_to_invalid_message() {
        let msg: Message = serde_json::from_value(json!({"id": "x"})).unwrap();
        assert!(!msg.is_valid());
    }

    #[test]
    fn test_serialization_skips_empty_optionals() {
        let msg = Message::notice("a", json!(1)).with_source("plugin-1");
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["category"], "Notice");
        assert_eq!(value["source"], "plugin-1");
        assert!(value.get("correlation_id").is_none());
        assert!(value.get("parallel_safe").is_none());
    }

    #[test]
    fn test_log_string_truncates_payload() {
        let msg = Message::notice("big", json!({"text": "x".repeat(200)}));
        let line = msg.to_log_string();
        assert!(line.starts_with("Notice[big]: "));
        assert!(line.ends_with("..."));
    }

    #[test]
    fn test_category_display() {
        assert_eq!(Category::IntentRequest.to_string(), "IntentRequest");
        assert!(Category::Intent.is_intent());
        assert!(!Category::Notice.is_intent());
    }
}
