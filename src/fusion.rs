//! Bus fusion: merge a source bus into a target bus.
//!
//! Steps, in order:
//! 1. compatibility check (fails before touching either bus): distinct live
//!    buses, matching transports, and source plugins that fit the target's
//!    ids, depth limit and resource ceiling
//! 2. snapshot of the source for the result record
//! 3. union of the source's subscriptions into the target
//! 4. plugin migration with state snapshot/restore and link repointing
//! 5. `core.lifecycle.migrated` / `core.lifecycle.fused` notices through the
//!    target's batch dispatcher
//! 6. source teardown
//! 7. history record on the target
//!
//! Fusion is best-effort: a failure in steps 3 to 5 is reported in the
//! result, and the source is still torn down so it cannot linger half-empty.
//! It is not a transaction. Nothing locks either bus while it runs.

use crate::messaging::{BusSink, Message, MessageBus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Fusion errors.
#[derive(Debug, thiserror::Error)]
pub enum FusionError {
    #[error("Incompatible cores: {0}")]
    IncompatibleCores(String),

    #[error("Fusion notification failed: {0}")]
    Notification(#[from] crate::messaging::BatchError),

    #[error("Plugin migration failed: {0}")]
    Migration(#[from] crate::plugins::PluginError),
}

/// Fusion options.
#[derive(Debug, Clone)]
pub struct FusionConfig {
    /// Emit lifecycle notices on the target.
    pub notify: bool,
    /// Caller-chosen id for the operation. Generated when absent.
    pub fusion_id: Option<String>,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            notify: true,
            fusion_id: None,
        }
    }
}

/// Source metadata captured before anything moves.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceInfo {
    pub bus_id: String,
    pub plugin_count: usize,
    pub subscriber_count: usize,
}

/// Outcome of a fusion.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FusionResult {
    pub success: bool,
    pub fusion_id: String,
    pub source_id: String,
    pub target_id: String,
    pub plugins_moved: usize,
    pub subscriptions_merged: usize,
    pub processing_time_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Entry in a target bus's fusion history.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FusionRecord {
    pub fusion_id: String,
    pub source_id: String,
    pub target_id: String,
    pub plugins_moved: usize,
    pub processing_time_ms: f64,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

/// Drives one fusion.
pub struct FusionCoordinator {
    config: FusionConfig,
}

impl FusionCoordinator {
    pub fn new(config: FusionConfig) -> Self {
        Self { config }
    }

    /// Check that `source` may be fused into `target`.
    pub fn check_compatible(source: &MessageBus, target: &MessageBus) -> Result<(), FusionError> {
        if source.same_bus(target) {
            return Err(FusionError::IncompatibleCores(
                "cannot fuse a bus with itself".into(),
            ));
        }
        if source.is_retired() {
            return Err(FusionError::IncompatibleCores(format!(
                "source {} is retired",
                source.id()
            )));
        }
        if target.is_retired() {
            return Err(FusionError::IncompatibleCores(format!(
                "target {} is retired",
                target.id()
            )));
        }
        if let (Some(a), Some(b)) = (source.transport_kind(), target.transport_kind()) {
            if a != b {
                return Err(FusionError::IncompatibleCores(format!(
                    "transport kinds differ: {a} vs {b}"
                )));
            }
        }
        target
            .check_adoption(source)
            .map_err(|e| FusionError::IncompatibleCores(format!("plugins do not fit: {e}")))
    }

    /// Fuse `source` into `target`. Never panics; failures land in the result.
    pub async fn fuse(&self, source: &MessageBus, target: &MessageBus) -> FusionResult {
        let started = Instant::now();
        let fusion_id = self
            .config
            .fusion_id
            .clone()
            .unwrap_or_else(|| format!("fusion-{}", uuid::Uuid::new_v4().simple()));
        let mut result = FusionResult {
            success: false,
            fusion_id: fusion_id.clone(),
            source_id: source.id().to_string(),
            target_id: target.id().to_string(),
            plugins_moved: 0,
            subscriptions_merged: 0,
            processing_time_ms: 0.0,
            source: None,
            error: None,
        };

        // 1. Nothing has been touched yet when this fails.
        if let Err(e) = Self::check_compatible(source, target) {
            warn!(source = %source.id(), target = %target.id(), error = %e, "Fusion rejected");
            result.error = Some(e.to_string());
            result.processing_time_ms = started.elapsed().as_secs_f64() * 1000.0;
            return result;
        }
        info!(fusion = %fusion_id, source = %source.id(), target = %target.id(), "Fusion started");

        // 2.
        let stats = source.get_stats();
        result.source = Some(SourceInfo {
            bus_id: stats.bus_id,
            plugin_count: stats.plugin_count,
            subscriber_count: stats.total_subscribers,
        });

        // 3 to 5; teardown runs regardless.
        let outcome = self.migrate(source, target, &fusion_id, &mut result).await;

        // 6.
        source.retire();

        result.processing_time_ms = started.elapsed().as_secs_f64() * 1000.0;
        match outcome {
            Ok(()) => result.success = true,
            Err(e) => {
                warn!(fusion = %fusion_id, error = %e, "Fusion finished with errors");
                result.error = Some(e.to_string());
            }
        }

        // 7.
        target.record_fusion(FusionRecord {
            fusion_id: fusion_id.clone(),
            source_id: result.source_id.clone(),
            target_id: result.target_id.clone(),
            plugins_moved: result.plugins_moved,
            processing_time_ms: result.processing_time_ms,
            success: result.success,
            timestamp: Utc::now(),
        });
        info!(
            fusion = %fusion_id,
            plugins_moved = result.plugins_moved,
            ms = result.processing_time_ms,
            "Fusion complete"
        );
        result
    }

    async fn migrate(
        &self,
        source: &MessageBus,
        target: &MessageBus,
        fusion_id: &str,
        result: &mut FusionResult,
    ) -> Result<(), FusionError> {
        // 3.
        result.subscriptions_merged = target.merge_subscriptions(source.export_subscriptions());
        debug!(fusion = %fusion_id, merged = result.subscriptions_merged, "Subscriptions merged");

        // 4.
        let mut moved = Vec::new();
        let mut failure = None;
        for (record, slot) in source.drain_plugins() {
            let id = record.id.clone();
            let was_ready = source.is_ready(&id);
            let state = slot
                .as_ref()
                .and_then(|s| s.instance.snapshot())
                .unwrap_or_else(|| default_snapshot(&id, &record.created_at));

            let restore_target = slot.as_ref().map(|s| s.instance.clone());
            if let Err(e) = target.adopt_plugin(record, slot, source.id()) {
                warn!(fusion = %fusion_id, plugin = %id, error = %e, "Plugin could not be adopted");
                if failure.is_none() {
                    failure = Some(e);
                }
                continue;
            }
            if let Some(instance) = restore_target {
                if let Err(e) = instance.restore(&state) {
                    warn!(fusion = %fusion_id, plugin = %id, error = %e, "Plugin state restore failed");
                }
            }
            if was_ready {
                target.mark_ready(&id);
            }
            moved.push(id);
        }
        result.plugins_moved = moved.len();
        if let Some(e) = failure {
            return Err(e.into());
        }

        // 5.
        if self.config.notify {
            let mut notices: Vec<Message> = moved
                .iter()
                .map(|id| {
                    Message::notice(
                        "core.lifecycle.migrated",
                        json!({
                            "pluginId": id,
                            "fusionId": fusion_id,
                            "fromBus": source.id(),
                            "toBus": target.id(),
                        }),
                    )
                    .parallel_safe()
                })
                .collect();
            notices.push(
                Message::notice(
                    "core.lifecycle.fused",
                    json!({
                        "fusionId": fusion_id,
                        "sourceId": source.id(),
                        "targetId": target.id(),
                        "pluginsMoved": moved.len(),
                        "subscriptionsMerged": result.subscriptions_merged,
                    }),
                )
                .parallel_safe(),
            );
            target
                .batch()
                .dispatch(notices, &BusSink::new(target.clone()))
                .await?;
        }
        Ok(())
    }
}

fn default_snapshot(id: &str, started_at: &DateTime<Utc>) -> Value {
    json!({ "pluginId": id, "startedAt": started_at, "state": "active" })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::{handler_fn, Category, ChannelTransport, Route};
    use crate::plugins::{PluginRecord, PluginSpec};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    async fn source_with_plugins(n: usize) -> MessageBus {
        let bus = MessageBus::new();
        for i in 0..n {
            bus.create_plugin(PluginSpec::new("counter").with_id(format!("c{i}")))
                .await
                .unwrap();
        }
        bus
    }

    // =========================================================================
    // Compatibility
    // =========================================================================

    #[tokio::test]
    async fn test_self_fusion_rejected_without_mutation() {
        let bus = source_with_plugins(2).await;
        let result = bus.fuse_with(&bus, FusionConfig::default()).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("Incompatible"));
        assert_eq!(bus.plugin_count(), 2);
        assert!(!bus.is_retired());
    }

    #[tokio::test]
    async fn test_transport_kind_mismatch() {
        struct Other;
        #[async_trait::async_trait]
        impl crate::messaging::Transport for Other {
            fn kind(&self) -> &str {
                "other"
            }
            async fn send(&self, _m: &Message) -> Result<usize, crate::messaging::TransportError> {
                Ok(0)
            }
        }

        let source = MessageBus::builder()
            .transport(Arc::new(ChannelTransport::new(4)))
            .build();
        let target = MessageBus::builder().transport(Arc::new(Other)).build();
        assert!(matches!(
            FusionCoordinator::check_compatible(&source, &target),
            Err(FusionError::IncompatibleCores(_))
        ));

        // One side without a transport is fine.
        assert!(FusionCoordinator::check_compatible(&source, &MessageBus::new()).is_ok());
    }

    // =========================================================================
    // Migration
    // =========================================================================

    #[tokio::test]
    async fn test_plugins_moved_and_source_empty() {
        let source = source_with_plugins(3).await;
        let target = MessageBus::new();

        let result = source.fuse_with(&target, FusionConfig::default()).await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.plugins_moved, 3);
        assert_eq!(result.source.as_ref().unwrap().plugin_count, 3);
        assert!(source.get_all_plugins().is_empty());
        assert_eq!(target.plugin_count(), 3);
        assert!(source.is_retired());
        assert!(!source.is_initialized());
    }

    #[tokio::test]
    async fn test_state_and_link_follow_plugin() {
        let source = MessageBus::new();
        source
            .create_plugin(PluginSpec::new("counter").with_id("c").with_config(json!({ "start": 5 })))
            .await
            .unwrap();
        let target = MessageBus::new();
        source.fuse_with(&target, FusionConfig::default()).await;

        // Migrated subscription delivers on the target.
        target.publish(Message::notice("app.tick", Value::Null)).await;
        let desc = target.describe_plugin("c").unwrap();
        // 5 restored, plus migrated and fused notices, plus the tick.
        assert_eq!(desc["count"], 5 + 2 + 1);
    }

    #[tokio::test]
    async fn test_subscriptions_union() {
        let source = MessageBus::new();
        let target = MessageBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let handler = handler_fn(move |_m| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        let route = Route::topic(Category::Notice, "test.ping");
        source.subscribe(route.clone(), handler.clone());
        target.subscribe(route.clone(), handler);

        let result = source.fuse_with(&target, FusionConfig::default()).await;
        assert_eq!(result.subscriptions_merged, 0);
        assert_eq!(target.publish(Message::notice("test.ping", Value::Null)).await, 1);
    }

    #[tokio::test]
    async fn test_resources_move_with_plugins() {
        let source = MessageBus::new();
        source
            .create_plugin(PluginSpec::new("echo").with_id("p").with_resource_cost(4))
            .await
            .unwrap();
        let target = MessageBus::new();
        source.fuse_with(&target, FusionConfig::default()).await;

        assert_eq!(source.resource_usage().total, 0);
        assert_eq!(target.resource_usage().by_owner.get(target.id()), Some(&4));
    }

    #[tokio::test]
    async fn test_bare_records_migrate_with_default_snapshot() {
        let source = MessageBus::new();
        source.register_plugin(PluginRecord::new("bare", "node"));
        let target = MessageBus::new();
        let result = source.fuse_with(&target, FusionConfig::default()).await;
        assert_eq!(result.plugins_moved, 1);
        assert!(target.get_plugin("bare").is_some());
    }

    // =========================================================================
    // Notices / History
    // =========================================================================

    #[tokio::test]
    async fn test_lifecycle_notices_emitted() {
        let source = source_with_plugins(2).await;
        let target = MessageBus::new();
        let migrated = Arc::new(AtomicUsize::new(0));
        let m = migrated.clone();
        target.subscribe(
            Route::topic(Category::Notice, "core.lifecycle.migrated"),
            handler_fn(move |_msg| {
                let m = m.clone();
                async move {
                    m.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );

        source.fuse_with(&target, FusionConfig::default()).await;
        assert_eq!(migrated.load(Ordering::SeqCst), 2);
        assert_eq!(target.batch().stats().parallel_messages, 3);
    }

    #[tokio::test]
    async fn test_history_and_retired_source() {
        let source = source_with_plugins(1).await;
        let target = MessageBus::new();
        let config = FusionConfig {
            fusion_id: Some("f-1".into()),
            ..FusionConfig::default()
        };
        source.fuse_with(&target, config).await;

        let history = target.fusion_history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].fusion_id, "f-1");
        assert_eq!(history[0].source_id, source.id());

        let again = source.fuse_with(&MessageBus::new(), FusionConfig::default()).await;
        assert!(!again.success);
        assert!(again.error.unwrap().contains("retired"));

        let status = target.send_intent("system.fusion.status", json!({})).await.unwrap();
        assert_eq!(status["count"], 1);
    }

    #[tokio::test]
    async fn test_overlapping_plugin_ids_rejected_before_changes() {
        let source = MessageBus::new();
        source
            .create_plugin(PluginSpec::new("echo").with_id("p"))
            .await
            .unwrap();
        let target = MessageBus::new();
        target
            .create_plugin(PluginSpec::new("counter").with_id("p"))
            .await
            .unwrap();
        target
            .create_plugin(PluginSpec::new("counter").with_id("k").with_parent("p"))
            .await
            .unwrap();

        let result = source.fuse_with(&target, FusionConfig::default()).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("already registered: p"));
        assert!(!source.is_retired());
        assert_eq!(source.plugin_count(), 1);

        assert_eq!(target.get_plugin("p").unwrap().kind, "counter");
        assert_eq!(target.get_children("p"), vec!["k".to_string()]);
        assert_eq!(target.get_parent("k").as_deref(), Some("p"));
        assert!(target.destroy_plugin("p", false).await.is_err());
        assert!(target.validate_hierarchy().is_empty());
    }

    #[tokio::test]
    async fn test_target_limits_checked_before_changes() {
        let source = MessageBus::new();
        source
            .create_plugin(PluginSpec::new("echo").with_id("a").with_resource_cost(70))
            .await
            .unwrap();
        source
            .create_plugin(PluginSpec::new("echo").with_id("b").with_parent("a"))
            .await
            .unwrap();

        let busy = MessageBus::new();
        busy.create_plugin(PluginSpec::new("echo").with_id("z").with_resource_cost(40))
            .await
            .unwrap();
        let err = FusionCoordinator::check_compatible(&source, &busy).unwrap_err();
        assert!(err.to_string().contains("Insufficient resources"));

        let shallow = MessageBus::builder()
            .settings(crate::config::BusSettings::new().with_max_depth(0))
            .build();
        let err = FusionCoordinator::check_compatible(&source, &shallow).unwrap_err();
        assert!(err.to_string().contains("Maximum hierarchy depth"));

        assert_eq!(source.plugin_count(), 2);
        assert_eq!(busy.plugin_count(), 1);
    }
}
