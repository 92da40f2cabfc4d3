//! Echo plugin: answers every intent with the payload it was sent.

use crate::plugins::{Plugin, PluginContext};
use async_trait::async_trait;
use serde_json::{json, Value};

pub struct EchoPlugin;

impl EchoPlugin {
    pub const KIND: &'static str = "echo";
}

#[async_trait]
impl Plugin for EchoPlugin {
    fn kind(&self) -> &str {
        Self::KIND
    }

    fn describe(&self) -> Value {
        json!({ "type": Self::KIND, "description": "Replies to intents with their payload" })
    }

    async fn on_intent(
        &self,
        _ctx: &PluginContext,
        _intent: &str,
        payload: &Value,
    ) -> anyhow::Result<Option<Value>> {
        Ok(Some(payload.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::BusLink;

    #[tokio::test]
    async fn test_echo_returns_payload() {
        let ctx = PluginContext::new("echo-1", BusLink::detached());
        let payload = json!({ "pluginId": "echo-1", "text": "hi" });
        let reply = EchoPlugin
            .on_intent(&ctx, "plugin.echo", &payload)
            .await
            .unwrap();
        assert_eq!(reply, Some(payload));
    }

    #[test]
    fn test_echo_has_no_interests() {
        assert!(EchoPlugin.interests().is_empty());
        assert_eq!(EchoPlugin.kind(), "echo");
    }
}
