//! Built-in intent handlers.

use super::{IntentCall, IntentError, IntentHandler};
use crate::messaging::{Message, MessageBus};
use crate::plugins::PluginSpec;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

/// Exact-name table for `system.*` intents.
pub struct SystemIntents;

impl SystemIntents {
    /// Every name the table answers.
    pub const NAMES: &'static [&'static str] = &[
        "system.boot.ready",
        "system.boot.status",
        "system.stats",
        "system.hierarchy",
        "system.validate",
        "system.plugin.create",
        "system.plugin.destroy",
        "system.plugin.reparent",
        "system.plugin.list",
        "system.plugin.status",
        "system.plugin.awaitReady",
        "system.plugin.ready",
        "system.fusion.status",
    ];
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value, IntentError> {
    serde_json::to_value(value).map_err(|e| IntentError::Handler(e.to_string()))
}

#[async_trait]
impl IntentHandler for SystemIntents {
    async fn handle(&self, bus: &MessageBus, call: &IntentCall) -> Result<Value, IntentError> {
        match call.name.as_str() {
            "system.boot.ready" => {
                let component = call.opt_str_field("componentId")?.unwrap_or("system");
                bus.mark_ready(component);
                Ok(json!({ "status": "ready", "componentId": component }))
            }
            "system.boot.status" => Ok(json!({
                "busId": bus.id(),
                "initialized": bus.is_initialized(),
                "retired": bus.is_retired(),
                "ready": bus.is_ready("system"),
                "pluginCount": bus.plugin_count(),
            })),
            "system.stats" => to_json(&bus.get_stats()),
            "system.hierarchy" => Ok(json!({
                "roots": bus.roots(),
                "tree": to_json(&bus.hierarchy_tree())?,
            })),
            "system.validate" => {
                let issues = bus.validate_hierarchy();
                Ok(json!({ "valid": issues.is_empty(), "issues": to_json(&issues)? }))
            }
            "system.plugin.create" => {
                let spec: PluginSpec = serde_json::from_value(call.payload.clone())
                    .map_err(|e| IntentError::InvalidPayload(e.to_string()))?;
                let record = bus.create_plugin(spec).await?;
                to_json(&record)
            }
            "system.plugin.destroy" => {
                let id = call.str_field("pluginId")?;
                let removed = bus.destroy_plugin(id, call.bool_field("force")).await?;
                let ids: Vec<&str> = removed.iter().map(|r| r.id.as_str()).collect();
                Ok(json!({ "destroyed": ids }))
            }
            "system.plugin.reparent" => {
                let id = call.str_field("pluginId")?;
                let new_parent = call.opt_str_field("newParentId")?;
                let old_parent = bus.reparent_plugin(id, new_parent).await?;
                Ok(json!({
                    "pluginId": id,
                    "oldParentId": old_parent,
                    "newParentId": new_parent,
                }))
            }
            "system.plugin.list" => {
                let plugins = match call.opt_str_field("type")? {
                    Some(kind) => bus.plugins_by_type(kind),
                    None => bus.get_all_plugins(),
                };
                Ok(json!({ "count": plugins.len(), "plugins": to_json(&plugins)? }))
            }
            "system.plugin.status" => {
                let id = call.str_field("pluginId")?;
                let record = bus
                    .get_plugin(id)
                    .ok_or_else(|| crate::plugins::PluginError::NotFound(id.to_string()))?;
                Ok(json!({
                    "plugin": to_json(&record)?,
                    "level": bus.get_level(id),
                    "children": bus.get_children(id),
                    "ready": bus.is_ready(id),
                    "description": bus.describe_plugin(id),
                }))
            }
            "system.plugin.awaitReady" => {
                let id = call.str_field("pluginId")?;
                let timeout = call
                    .payload
                    .get("timeoutMs")
                    .and_then(Value::as_u64)
                    .map(Duration::from_millis);
                bus.wait_ready(id, timeout).await?;
                Ok(json!({ "pluginId": id, "ready": true }))
            }
            "system.plugin.ready" => {
                let id = call.str_field("pluginId")?;
                bus.mark_ready(id);
                Ok(json!({ "pluginId": id, "ready": true }))
            }
            "system.fusion.status" => {
                let history = bus.fusion_history();
                Ok(json!({
                    "retired": bus.is_retired(),
                    "count": history.len(),
                    "history": to_json(&history)?,
                }))
            }
            other => Err(IntentError::UnknownSystemIntent(other.to_string())),
        }
    }
}

/// Delivers `plugin.*` intents to the plugin named by `pluginId`.
pub struct PluginIntents;

#[async_trait]
impl IntentHandler for PluginIntents {
    async fn handle(&self, bus: &MessageBus, call: &IntentCall) -> Result<Value, IntentError> {
        let id = call.str_field("pluginId")?;
        bus.plugin_intent(id, &call.name, &call.payload).await
    }
}

/// Fallback: re-publish the intent as a plain `Intent` message.
pub struct ForwardIntents;

#[async_trait]
impl IntentHandler for ForwardIntents {
    async fn handle(&self, bus: &MessageBus, call: &IntentCall) -> Result<Value, IntentError> {
        let mut message = Message::intent(&call.name, call.payload.clone())
            .with_correlation_id(&call.correlation_id);
        if let Some(source) = &call.source {
            message = message.with_source(source);
        }
        let delivered = bus.publish(message).await;
        Ok(json!({ "status": "forwarded", "intent": call.name, "delivered": delivered }))
    }
}
