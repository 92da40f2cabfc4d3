//! Plugin capability trait, per-plugin context and the factory table.

use crate::intent::{IntentError, SendIntentOptions};
use crate::messaging::{ArcHandler, BusLink, Message, MessageBus, MessageHandler, Route};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::registry::PluginError;

/// Trait for all plugin kinds.
///
/// A plugin never holds a reference to another plugin. It talks to the rest
/// of the system through the [`PluginContext`] it is handed.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Type string the plugin was created from (e.g. "echo").
    fn kind(&self) -> &str;

    /// Free-form description for listings.
    fn describe(&self) -> Value {
        json!({ "type": self.kind() })
    }

    /// Routes the plugin wants delivered to [`on_message`](Self::on_message).
    fn interests(&self) -> Vec<Route> {
        Vec::new()
    }

    async fn on_message(&self, _ctx: &PluginContext, _message: &Message) -> anyhow::Result<()> {
        Ok(())
    }

    /// Answer a `plugin.*` intent addressed to this plugin.
    ///
    /// `Ok(None)` means the plugin does not handle intents.
    async fn on_intent(
        &self,
        _ctx: &PluginContext,
        _intent: &str,
        _payload: &Value,
    ) -> anyhow::Result<Option<Value>> {
        Ok(None)
    }

    /// State carried across fusion. `None` uses a default snapshot.
    fn snapshot(&self) -> Option<Value> {
        None
    }

    fn restore(&self, _state: &Value) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Shared plugin instance.
pub type ArcPlugin = Arc<dyn Plugin>;

/// What a plugin sees of the bus that currently owns it.
///
/// The owning bus is looked up through a [`BusLink`] on every call, so a
/// plugin migrated by fusion talks to its new bus without being rebuilt.
#[derive(Clone)]
pub struct PluginContext {
    plugin_id: String,
    link: BusLink,
}

impl PluginContext {
    pub fn new(plugin_id: impl Into<String>, link: BusLink) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            link,
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn link(&self) -> &BusLink {
        &self.link
    }

    /// The owning bus, if it is still alive.
    pub fn bus(&self) -> Option<MessageBus> {
        self.link.bus()
    }

    /// Publish a notice from this plugin. Returns the delivered count.
    pub async fn notice(&self, topic: &str, payload: Value) -> usize {
        match self.bus() {
            Some(bus) => {
                bus.publish(Message::notice(topic, payload).with_source(&self.plugin_id))
                    .await
            }
            None => 0,
        }
    }

    pub async fn send_intent(&self, name: &str, payload: Value) -> Result<Value, IntentError> {
        let bus = self
            .bus()
            .ok_or_else(|| IntentError::Unsupported("plugin is detached from its bus".into()))?;
        bus.send_intent_with(
            name,
            payload,
            SendIntentOptions::default().with_source(&self.plugin_id),
        )
        .await
    }

    /// Declare this plugin ready for readiness waiters.
    pub fn mark_ready(&self) {
        if let Some(bus) = self.bus() {
            bus.mark_ready(&self.plugin_id);
        }
    }
}

/// Handler that feeds bus messages into a plugin.
pub(crate) struct PluginInbox {
    plugin: ArcPlugin,
    ctx: PluginContext,
}

impl PluginInbox {
    pub(crate) fn handler(plugin: ArcPlugin, ctx: PluginContext) -> ArcHandler {
        Arc::new(Self { plugin, ctx })
    }
}

#[async_trait]
impl MessageHandler for PluginInbox {
    async fn handle(&self, message: &Message) -> anyhow::Result<()> {
        self.plugin.on_message(&self.ctx, message).await
    }
}

/// Request to create a plugin from the factory table.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PluginSpec {
    #[serde(rename = "type")]
    pub kind: String,
    /// Generated from the kind when absent.
    pub id: Option<String>,
    pub parent_id: Option<String>,
    pub display_name: Option<String>,
    pub resource_cost: u64,
    pub metadata: Value,
    /// Passed to the factory.
    pub config: Value,
}

impl PluginSpec {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_resource_cost(mut self, cost: u64) -> Self {
        self.resource_cost = cost;
        self
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }
}

/// Builds a plugin from its creation config.
pub type PluginFactory = Arc<dyn Fn(&Value) -> anyhow::Result<ArcPlugin> + Send + Sync>;

/// Factory table keyed by type string.
#[derive(Clone, Default)]
pub struct PluginFactories {
    factories: BTreeMap<String, PluginFactory>,
}

impl PluginFactories {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table with the built-in kinds registered.
    pub fn with_builtins() -> Self {
        let mut table = Self::new();
        super::builtin::register_builtins(&mut table);
        table
    }

    pub fn register<F>(&mut self, kind: impl Into<String>, factory: F)
    where
        F: Fn(&Value) -> anyhow::Result<ArcPlugin> + Send + Sync + 'static,
    {
        self.factories.insert(kind.into(), Arc::new(factory));
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    /// Registered type strings, sorted.
    pub fn kinds(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    pub fn create(&self, kind: &str, config: &Value) -> Result<ArcPlugin, PluginError> {
        let factory = self
            .factories
            .get(kind)
            .ok_or_else(|| PluginError::UnknownPluginType(kind.to_string()))?;
        factory(config).map_err(|e| PluginError::Factory(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Quiet;

    #[async_trait]
    impl Plugin for Quiet {
        fn kind(&self) -> &str {
            "quiet"
        }
    }

    #[test]
    fn test_default_describe() {
        assert_eq!(Quiet.describe(), json!({ "type": "quiet" }));
        assert!(Quiet.interests().is_empty());
        assert!(Quiet.snapshot().is_none());
    }

    #[test]
    fn test_factory_table() {
        let mut table = PluginFactories::new();
        table.register("quiet", |_| Ok(Arc::new(Quiet) as ArcPlugin));
        assert!(table.contains("quiet"));
        assert_eq!(table.kinds(), vec!["quiet".to_string()]);

        let plugin = table.create("quiet", &Value::Null).unwrap();
        assert_eq!(plugin.kind(), "quiet");

        let err = table.create("loud", &Value::Null).err().unwrap();
        assert_eq!(err, PluginError::UnknownPluginType("loud".into()));
    }

    #[test]
    fn test_factory_failure_is_reported() {
        let mut table = PluginFactories::new();
        table.register("broken", |_| Err(anyhow::anyhow!("no config")));
        let err = table.create("broken", &Value::Null).err().unwrap();
        assert_eq!(err, PluginError::Factory("no config".into()));
    }

    #[test]
    fn test_builtins_present() {
        let table = PluginFactories::with_builtins();
        assert!(table.contains("echo"));
        assert!(table.contains("counter"));
    }

    #[test]
    fn test_spec_from_json() {
        let spec: PluginSpec = serde_json::from_value(json!({
            "type": "counter",
            "parentId": "root",
            "resourceCost": 7,
            "config": { "start": 2 }
        }))
        .unwrap();
        assert_eq!(spec.kind, "counter");
        assert_eq!(spec.parent_id.as_deref(), Some("root"));
        assert_eq!(spec.resource_cost, 7);
        assert!(spec.id.is_none());
    }

    #[tokio::test]
    async fn test_detached_context_is_inert() {
        let ctx = PluginContext::new("p", BusLink::detached());
        assert!(ctx.bus().is_none());
        assert_eq!(ctx.notice("x.y", Value::Null).await, 0);
        assert!(ctx.send_intent("system.stats", Value::Null).await.is_err());
    }
}
