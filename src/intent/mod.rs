//! Intent sub-protocol: named commands answered with a correlated response.
//!
//! Intents are routed by longest matching namespace prefix:
//! - `system.` resolves through an exact-name table ([`SystemIntents`])
//! - `plugin.` is delivered to the plugin named by the payload's `pluginId`
//! - anything else is re-published on the bus as a plain `Intent` message

mod router;
mod system;

pub use router::{IntentRecord, IntentRouter, IntentStats};
pub use system::{ForwardIntents, PluginIntents, SystemIntents};

use crate::messaging::MessageBus;
use crate::plugins::{PluginError, ReadinessError};
use async_trait::async_trait;
use serde_json::Value;

/// Intent errors.
#[derive(Debug, thiserror::Error)]
pub enum IntentError {
    #[error("Intent name is required")]
    MissingIntent,

    #[error("Unknown intent: {0}")]
    UnknownIntent(String),

    #[error("Unknown system intent: {0}")]
    UnknownSystemIntent(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error(transparent)]
    Timeout(#[from] ReadinessError),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Intent handler failed: {0}")]
    Handler(String),
}

/// One intent invocation as handlers see it.
#[derive(Debug, Clone)]
pub struct IntentCall {
    pub name: String,
    pub payload: Value,
    pub correlation_id: String,
    pub source: Option<String>,
}

impl IntentCall {
    /// Required string field of the payload.
    pub fn str_field(&self, key: &str) -> Result<&str, IntentError> {
        self.payload
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| IntentError::InvalidPayload(format!("missing string field `{key}`")))
    }

    /// Optional string field; JSON `null` counts as absent.
    pub fn opt_str_field(&self, key: &str) -> Result<Option<&str>, IntentError> {
        match self.payload.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.as_str())),
            Some(_) => Err(IntentError::InvalidPayload(format!(
                "field `{key}` must be a string"
            ))),
        }
    }

    pub fn bool_field(&self, key: &str) -> bool {
        self.payload
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// Options for [`MessageBus::send_intent_with`].
#[derive(Debug, Clone)]
pub struct SendIntentOptions {
    /// Reuse a caller-chosen correlation id. A fresh one is generated otherwise.
    pub correlation_id: Option<String>,
    /// Publish an `IntentResponse` once the intent settles.
    pub expect_response: bool,
    pub source: Option<String>,
}

impl Default for SendIntentOptions {
    fn default() -> Self {
        Self {
            correlation_id: None,
            expect_response: true,
            source: None,
        }
    }
}

impl SendIntentOptions {
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn without_response(mut self) -> Self {
        self.expect_response = false;
        self
    }
}

/// Resolves one class of intents.
#[async_trait]
pub trait IntentHandler: Send + Sync {
    async fn handle(&self, bus: &MessageBus, call: &IntentCall) -> Result<Value, IntentError>;
}
