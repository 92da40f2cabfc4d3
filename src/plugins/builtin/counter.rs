//! Counter plugin: counts the notices it observes.
//!
//! Config (all optional):
//!
//! ```json
//! { "topics": ["test.ping"], "start": 0 }
//! ```
//!
//! Without `topics` every notice is counted. The count is carried across
//! fusion through [`Plugin::snapshot`] / [`Plugin::restore`].

use crate::messaging::{Category, Message, Route};
use crate::plugins::{Plugin, PluginContext};
use anyhow::Context;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};

pub struct CounterPlugin {
    topics: Vec<String>,
    count: AtomicU64,
}

impl CounterPlugin {
    pub const KIND: &'static str = "counter";

    pub fn new() -> Self {
        Self {
            topics: Vec::new(),
            count: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &Value) -> anyhow::Result<Self> {
        let topics = match config.get("topics") {
            Some(Value::Array(items)) => items
                .iter()
                .map(|t| {
                    t.as_str()
                        .map(str::to_string)
                        .context("counter topics must be strings")
                })
                .collect::<anyhow::Result<Vec<_>>>()?,
            Some(Value::Null) | None => Vec::new(),
            Some(_) => anyhow::bail!("counter topics must be an array"),
        };
        let start = config.get("start").and_then(Value::as_u64).unwrap_or(0);
        Ok(Self {
            topics,
            count: AtomicU64::new(start),
        })
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }
}

impl Default for CounterPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Plugin for CounterPlugin {
    fn kind(&self) -> &str {
        Self::KIND
    }

    fn describe(&self) -> Value {
        json!({ "type": Self::KIND, "count": self.count(), "topics": self.topics })
    }

    fn interests(&self) -> Vec<Route> {
        if self.topics.is_empty() {
            vec![Route::all(Category::Notice)]
        } else {
            self.topics
                .iter()
                .map(|t| Route::topic(Category::Notice, t.clone()))
                .collect()
        }
    }

    async fn on_message(&self, ctx: &PluginContext, message: &Message) -> anyhow::Result<()> {
        // Own notices are not counted.
        if message.source() == Some(ctx.plugin_id()) {
            return Ok(());
        }
        self.count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn on_intent(
        &self,
        _ctx: &PluginContext,
        intent: &str,
        _payload: &Value,
    ) -> anyhow::Result<Option<Value>> {
        if intent.ends_with(".reset") {
            self.count.store(0, Ordering::SeqCst);
        }
        Ok(Some(json!({ "count": self.count() })))
    }

    fn snapshot(&self) -> Option<Value> {
        Some(json!({ "count": self.count() }))
    }

    fn restore(&self, state: &Value) -> anyhow::Result<()> {
        let count = state
            .get("count")
            .and_then(Value::as_u64)
            .context("counter snapshot has no count")?;
        self.count.store(count, Ordering::SeqCst);
        Ok(())
    }
}
