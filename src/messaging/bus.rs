//! Message bus: subscription fan-out, plugin ownership and intent entry point.
//!
//! [`MessageBus`] is a cheap handle over shared state. There is no global
//! instance; collaborators are handed the bus they should talk to.

use super::batch::{BatchDispatcher, BatchError, BatchResult, BatchStats};
use super::subscription::{
    ArcHandler, ExportedSubscription, MessageHandler, Route, SubscriptionId, SubscriptionOrigin,
    SubscriptionRegistry,
};
use super::transport::{Transport, TransportError};
use super::{Category, Message};
use crate::config::BusSettings;
use crate::fusion::{FusionConfig, FusionCoordinator, FusionRecord, FusionResult};
use crate::intent::{IntentCall, IntentError, IntentHandler, IntentRouter, IntentStats, SendIntentOptions};
use crate::plugins::{
    ArcPlugin, IntegrityIssue, PluginContext, PluginError, PluginFactories, PluginInbox,
    PluginRecord, PluginRegistry, PluginSpec, PluginTreeNode, ReadinessBoard, ReadinessError,
    RegistryLimits, ResourceUsage,
};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{
    Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak,
};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Bus errors.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Invalid message: {0}")]
    InvalidMessage(&'static str),

    /// Local handlers ran; the transport then refused the message.
    #[error("Transport failed after {delivered} local deliveries: {source}")]
    Transport {
        delivered: usize,
        #[source]
        source: TransportError,
    },

    #[error("Bus has been retired by fusion")]
    Retired,
}

/// A plugin instance and the context it was handed.
pub(crate) struct PluginSlot {
    pub(crate) instance: ArcPlugin,
    pub(crate) ctx: PluginContext,
}

pub(crate) struct BusInner {
    id: String,
    settings: BusSettings,
    subscriptions: RwLock<SubscriptionRegistry>,
    plugins: RwLock<PluginRegistry>,
    instances: RwLock<HashMap<String, PluginSlot>>,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    factories: RwLock<PluginFactories>,
    router: IntentRouter,
    batch: BatchDispatcher,
    readiness: ReadinessBoard,
    fusions: Mutex<Vec<FusionRecord>>,
    initialized: AtomicBool,
    retired: AtomicBool,
    published: AtomicU64,
    rejected: AtomicU64,
    delivered: AtomicU64,
}

/// Handle to one bus instance.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

/// Builder for [`MessageBus`].
#[derive(Default)]
pub struct BusBuilder {
    id: Option<String>,
    settings: BusSettings,
    transport: Option<Arc<dyn Transport>>,
    factories: Option<PluginFactories>,
}

impl BusBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn settings(mut self, settings: BusSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Replace the factory table (built-in kinds are used otherwise).
    pub fn factories(mut self, factories: PluginFactories) -> Self {
        self.factories = Some(factories);
        self
    }

    pub fn build(self) -> MessageBus {
        let id = self
            .id
            .unwrap_or_else(|| format!("bus-{}", uuid::Uuid::new_v4().simple()));
        let settings = self.settings;
        let limits = RegistryLimits {
            max_depth: settings.max_depth,
            max_traversal_depth: settings.max_traversal_depth,
            resource_ceiling: settings.resource_ceiling,
        };

        let batch = BatchDispatcher::new(settings.trust_parallel_flag);
        for topic in &settings.parallel_safe_topics {
            batch.declare_parallel_safe(topic.clone());
        }

        let bus = MessageBus {
            inner: Arc::new(BusInner {
                plugins: RwLock::new(PluginRegistry::new(id.clone(), limits)),
                router: IntentRouter::new(settings.intent_history_limit),
                id,
                subscriptions: RwLock::new(SubscriptionRegistry::new()),
                instances: RwLock::new(HashMap::new()),
                transport: RwLock::new(self.transport),
                factories: RwLock::new(
                    self.factories.unwrap_or_else(PluginFactories::with_builtins),
                ),
                batch,
                readiness: ReadinessBoard::new(),
                fusions: Mutex::new(Vec::new()),
                initialized: AtomicBool::new(false),
                retired: AtomicBool::new(false),
                published: AtomicU64::new(0),
                rejected: AtomicU64::new(0),
                delivered: AtomicU64::new(0),
                settings,
            }),
        };
        bus.ensure_initialized();
        bus
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl MessageBus {
    /// Bus with default settings, no transport and the built-in plugin kinds.
    pub fn new() -> Self {
        BusBuilder::new().build()
    }

    pub fn builder() -> BusBuilder {
        BusBuilder::new()
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn settings(&self) -> &BusSettings {
        &self.inner.settings
    }

    pub fn same_bus(&self, other: &MessageBus) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::SeqCst)
    }

    pub fn is_retired(&self) -> bool {
        self.inner.retired.load(Ordering::SeqCst)
    }

    fn ensure_initialized(&self) {
        if self.is_retired() || self.inner.initialized.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.inner.settings.route_inbound_intents {
            let listener: ArcHandler = Arc::new(InboundIntents {
                bus: Arc::downgrade(&self.inner),
            });
            write(&self.inner.subscriptions).add(
                Route::all(Category::IntentRequest),
                listener,
                SubscriptionOrigin::System,
            );
        }
        debug!(bus = %self.inner.id, "Bus initialized");
    }

    // =========================================================================
    // Transport
    // =========================================================================

    pub fn set_transport(&self, transport: Option<Arc<dyn Transport>>) {
        *write(&self.inner.transport) = transport;
    }

    pub fn transport(&self) -> Option<Arc<dyn Transport>> {
        read(&self.inner.transport).clone()
    }

    pub fn transport_kind(&self) -> Option<String> {
        read(&self.inner.transport)
            .as_ref()
            .map(|t| t.kind().to_string())
    }

    // =========================================================================
    // Subscribe / Publish
    // =========================================================================

    /// Append `handler` to the route's list.
    ///
    /// Subscribing the same handler twice creates two entries. The returned
    /// [`Subscription`] removes exactly this entry.
    pub fn subscribe(&self, route: impl Into<Route>, handler: ArcHandler) -> Subscription {
        self.subscribe_as(route, handler, SubscriptionOrigin::User)
    }

    pub fn subscribe_as(
        &self,
        route: impl Into<Route>,
        handler: ArcHandler,
        origin: SubscriptionOrigin,
    ) -> Subscription {
        self.ensure_initialized();
        let route = route.into();
        let id = write(&self.inner.subscriptions).add(route.clone(), handler, origin);
        debug!(bus = %self.inner.id, route = %route, "Subscribed");
        Subscription {
            bus: Arc::downgrade(&self.inner),
            route,
            id,
        }
    }

    /// Remove the earliest entry of `handler` on `route`.
    pub fn unsubscribe(&self, route: &Route, handler: &ArcHandler) -> bool {
        write(&self.inner.subscriptions).remove_handler(route, handler)
    }

    pub fn subscriber_count(&self, route: &Route) -> usize {
        read(&self.inner.subscriptions).subscriber_count(route)
    }

    /// Publish `message`, returning the number of handlers invoked.
    ///
    /// Invalid messages are dropped and yield `0`. A transport failure is
    /// logged; the local delivered count is still returned.
    pub async fn publish(&self, message: Message) -> usize {
        match self.try_publish(message).await {
            Ok(delivered) => delivered,
            Err(BusError::Transport { delivered, source }) => {
                warn!(bus = %self.inner.id, error = %source, "Transport send failed");
                delivered
            }
            Err(_) => 0,
        }
    }

    /// Publish with a discriminated error.
    ///
    /// Handlers run one after another in subscription order. A failing
    /// handler is logged and skipped; it still counts as invoked.
    pub async fn try_publish(&self, message: Message) -> Result<usize, BusError> {
        if self.is_retired() {
            self.inner.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(BusError::Retired);
        }
        let category = match message.validate() {
            Ok(category) => category,
            Err(reason) => {
                self.inner.rejected.fetch_add(1, Ordering::Relaxed);
                debug!(bus = %self.inner.id, reason, "Rejected invalid message");
                return Err(BusError::InvalidMessage(reason));
            }
        };
        self.ensure_initialized();
        self.inner.published.fetch_add(1, Ordering::Relaxed);

        // Snapshot so handlers may subscribe or publish re-entrantly.
        let handlers = read(&self.inner.subscriptions).handlers_for(category, message.topic());
        let mut delivered = 0;
        for handler in handlers {
            delivered += 1;
            if let Err(e) = handler.handle(&message).await {
                warn!(
                    bus = %self.inner.id,
                    topic = %message.topic(),
                    error = %e,
                    "HandlerFailure: subscriber raised"
                );
            }
        }
        self.inner
            .delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);

        if let Some(transport) = self.transport() {
            transport
                .send(&message)
                .await
                .map_err(|source| BusError::Transport { delivered, source })?;
        }
        Ok(delivered)
    }

    /// Remove every subscription and mark the bus uninitialized.
    ///
    /// The next subscribe or publish re-initializes it.
    pub fn clear(&self) {
        write(&self.inner.subscriptions).clear();
        self.inner.initialized.store(false, Ordering::SeqCst);
        debug!(bus = %self.inner.id, "Bus cleared");
    }

    pub(crate) fn export_subscriptions(&self) -> Vec<ExportedSubscription> {
        read(&self.inner.subscriptions).export()
    }

    pub(crate) fn merge_subscriptions(&self, incoming: Vec<ExportedSubscription>) -> usize {
        self.ensure_initialized();
        write(&self.inner.subscriptions).merge(incoming)
    }

    // =========================================================================
    // Batch
    // =========================================================================

    /// Publish a batch through this bus.
    pub async fn publish_batch(&self, messages: Vec<Message>) -> Result<BatchResult, BatchError> {
        self.inner
            .batch
            .dispatch(messages, &BusSink::new(self.clone()))
            .await
    }

    pub fn declare_parallel_safe(&self, topic: impl Into<String>) {
        self.inner.batch.declare_parallel_safe(topic);
    }

    pub fn batch(&self) -> &BatchDispatcher {
        &self.inner.batch
    }

    // =========================================================================
    // Intents
    // =========================================================================

    pub async fn send_intent(&self, name: &str, payload: Value) -> Result<Value, IntentError> {
        self.send_intent_with(name, payload, SendIntentOptions::default())
            .await
    }

    /// Route an intent and, unless disabled, publish the correlated response.
    ///
    /// The response carries either the success payload or an
    /// `{error, correlationId, timestamp}` failure payload.
    pub async fn send_intent_with(
        &self,
        name: &str,
        payload: Value,
        options: SendIntentOptions,
    ) -> Result<Value, IntentError> {
        if name.is_empty() {
            return Err(IntentError::MissingIntent);
        }
        let call = IntentCall {
            name: name.to_string(),
            payload,
            correlation_id: options
                .correlation_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            source: options.source,
        };

        let result = self.inner.router.route(self, &call).await;

        if options.expect_response {
            let body = match &result {
                Ok(value) => value.clone(),
                Err(e) => json!({
                    "error": e.to_string(),
                    "correlationId": call.correlation_id,
                    "timestamp": super::monotonic_now(),
                }),
            };
            let mut response = Message::intent_response(name, &call.correlation_id, body);
            if let Some(source) = &call.source {
                response = response.with_source(source);
            }
            self.publish(response).await;
        }
        result
    }

    /// Add a prefix route to this bus's intent router.
    pub fn register_intent_route(&self, prefix: impl Into<String>, handler: Arc<dyn IntentHandler>) {
        self.inner.router.register_route(prefix, handler);
    }

    pub fn intent_stats(&self) -> IntentStats {
        self.inner.router.stats()
    }

    /// Deliver a `plugin.*` intent to plugin `id`.
    pub async fn plugin_intent(
        &self,
        id: &str,
        name: &str,
        payload: &Value,
    ) -> Result<Value, IntentError> {
        let (instance, ctx) = {
            let instances = read(&self.inner.instances);
            match instances.get(id) {
                Some(slot) => (slot.instance.clone(), slot.ctx.clone()),
                None if read(&self.inner.plugins).contains(id) => {
                    return Err(IntentError::Unsupported(format!(
                        "plugin {id} has no instance"
                    )))
                }
                None => return Err(PluginError::NotFound(id.to_string()).into()),
            }
        };
        match instance.on_intent(&ctx, name, payload).await {
            Ok(Some(value)) => Ok(value),
            Ok(None) => Err(IntentError::UnknownIntent(name.to_string())),
            Err(e) => Err(IntentError::Handler(e.to_string())),
        }
    }

    // =========================================================================
    // Plugins
    // =========================================================================

    /// Register a bare record. Returns false (no mutation) when rejected.
    pub fn register_plugin(&self, record: PluginRecord) -> bool {
        match write(&self.inner.plugins).register(record) {
            Ok(()) => true,
            Err(e) => {
                warn!(bus = %self.inner.id, error = %e, "Plugin registration rejected");
                false
            }
        }
    }

    /// Unregister a childless plugin. Returns false when not found or when
    /// children remain.
    pub async fn unregister_plugin(&self, id: &str) -> bool {
        self.destroy_plugin(id, false).await.is_ok()
    }

    /// Build a plugin from the factory table and attach it.
    pub async fn create_plugin(&self, spec: PluginSpec) -> Result<PluginRecord, PluginError> {
        let instance = read(&self.inner.factories).create(&spec.kind, &spec.config)?;
        let id = spec.id.clone().unwrap_or_else(|| {
            let suffix = uuid::Uuid::new_v4().simple().to_string();
            format!("{}-{}", spec.kind, &suffix[..8])
        });

        let mut record = PluginRecord::new(&id, &spec.kind)
            .with_resource_cost(spec.resource_cost)
            .with_metadata(spec.metadata.clone());
        if let Some(parent) = &spec.parent_id {
            record = record.with_parent(parent);
        }
        if let Some(name) = &spec.display_name {
            record = record.with_display_name(name);
        }

        self.attach_plugin(record, instance).await
    }

    /// Register `record` with depth and resource checks, install `instance`
    /// and subscribe it to its interests.
    pub async fn attach_plugin(
        &self,
        record: PluginRecord,
        instance: ArcPlugin,
    ) -> Result<PluginRecord, PluginError> {
        let id = record.id.clone();
        write(&self.inner.plugins).create(record)?;
        self.install_instance(&id, instance, PluginContext::new(&id, BusLink::to(self)));

        let record = self
            .get_plugin(&id)
            .ok_or_else(|| PluginError::NotFound(id.clone()))?;
        info!(bus = %self.inner.id, plugin = %id, kind = %record.kind, "Plugin created");
        self.publish(
            Message::notice(
                "plugin.initialized",
                json!({ "pluginId": id, "type": record.kind, "parentId": record.parent_id }),
            )
            .with_source(&id),
        )
        .await;
        Ok(record)
    }

    fn install_instance(&self, id: &str, instance: ArcPlugin, ctx: PluginContext) {
        for route in instance.interests() {
            self.subscribe_as(
                route,
                PluginInbox::handler(instance.clone(), ctx.clone()),
                SubscriptionOrigin::Plugin(id.to_string()),
            );
        }
        write(&self.inner.instances).insert(id.to_string(), PluginSlot { instance, ctx });
    }

    /// Destroy a plugin.
    ///
    /// Rejected with `HasChildren` while children remain unless `force` is
    /// set, in which case the whole subtree goes, deepest first.
    pub async fn destroy_plugin(
        &self,
        id: &str,
        force: bool,
    ) -> Result<Vec<PluginRecord>, PluginError> {
        let removed = {
            let mut plugins = write(&self.inner.plugins);
            if force {
                plugins.unregister_cascade(id)?
            } else {
                vec![plugins.unregister(id)?]
            }
        };

        for record in &removed {
            write(&self.inner.instances).remove(&record.id);
            write(&self.inner.subscriptions)
                .remove_origin(&SubscriptionOrigin::Plugin(record.id.clone()));
            self.inner.readiness.forget(&record.id);
            info!(bus = %self.inner.id, plugin = %record.id, "Plugin destroyed");
            self.publish(
                Message::notice("plugin.shutdown", json!({ "pluginId": record.id }))
                    .with_source(&record.id),
            )
            .await;
        }
        Ok(removed)
    }

    /// Move a plugin under `new_parent`, or to the root level with `None`.
    pub async fn reparent_plugin(
        &self,
        id: &str,
        new_parent: Option<&str>,
    ) -> Result<Option<String>, PluginError> {
        let old_parent = write(&self.inner.plugins).reparent(id, new_parent)?;
        self.publish(Message::notice(
            "plugin.reparented",
            json!({ "pluginId": id, "oldParentId": old_parent, "newParentId": new_parent }),
        ))
        .await;
        Ok(old_parent)
    }

    pub fn get_plugin(&self, id: &str) -> Option<PluginRecord> {
        read(&self.inner.plugins).get(id).cloned()
    }

    pub fn plugin_instance(&self, id: &str) -> Option<ArcPlugin> {
        read(&self.inner.instances)
            .get(id)
            .map(|slot| slot.instance.clone())
    }

    pub fn describe_plugin(&self, id: &str) -> Option<Value> {
        self.plugin_instance(id).map(|p| p.describe())
    }

    pub fn plugin_count(&self) -> usize {
        read(&self.inner.plugins).len()
    }

    /// All plugins in registration order.
    pub fn get_all_plugins(&self) -> Vec<PluginRecord> {
        read(&self.inner.plugins).all().into_iter().cloned().collect()
    }

    pub fn plugins_by_type(&self, kind: &str) -> Vec<PluginRecord> {
        read(&self.inner.plugins)
            .by_type(kind)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn get_parent(&self, id: &str) -> Option<String> {
        read(&self.inner.plugins).get_parent(id)
    }

    pub fn get_children(&self, id: &str) -> Vec<String> {
        read(&self.inner.plugins).get_children(id)
    }

    pub fn get_descendants(&self, id: &str) -> Vec<String> {
        read(&self.inner.plugins).get_descendants(id)
    }

    pub fn get_ancestors(&self, id: &str) -> Vec<String> {
        read(&self.inner.plugins).get_ancestors(id)
    }

    pub fn get_siblings(&self, id: &str) -> Vec<String> {
        read(&self.inner.plugins).get_siblings(id)
    }

    pub fn get_level(&self, id: &str) -> usize {
        read(&self.inner.plugins).get_level(id)
    }

    pub fn roots(&self) -> Vec<String> {
        read(&self.inner.plugins).roots()
    }

    pub fn hierarchy_tree(&self) -> Vec<PluginTreeNode> {
        read(&self.inner.plugins).tree()
    }

    pub fn validate_hierarchy(&self) -> Vec<IntegrityIssue> {
        read(&self.inner.plugins).validate_integrity()
    }

    pub fn resource_usage(&self) -> ResourceUsage {
        read(&self.inner.plugins).resource_usage()
    }

    /// Register an extra plugin kind.
    pub fn register_plugin_kind<F>(&self, kind: impl Into<String>, factory: F)
    where
        F: Fn(&Value) -> anyhow::Result<ArcPlugin> + Send + Sync + 'static,
    {
        write(&self.inner.factories).register(kind, factory);
    }

    pub fn plugin_kinds(&self) -> Vec<String> {
        read(&self.inner.factories).kinds()
    }

    /// Take every plugin out of this bus, with its instance when it has one.
    pub(crate) fn drain_plugins(&self) -> Vec<(PluginRecord, Option<PluginSlot>)> {
        let records = write(&self.inner.plugins).drain();
        let mut instances = write(&self.inner.instances);
        records
            .into_iter()
            .map(|record| {
                let slot = instances.remove(&record.id);
                (record, slot)
            })
            .collect()
    }

    /// Accept a plugin migrated from the bus whose root owner was `previous_owner`.
    pub(crate) fn adopt_plugin(
        &self,
        record: PluginRecord,
        slot: Option<PluginSlot>,
        previous_owner: &str,
    ) -> Result<(), PluginError> {
        let id = record.id.clone();
        write(&self.inner.plugins).adopt(record, previous_owner)?;
        if let Some(slot) = slot {
            slot.ctx.link().repoint(self);
            write(&self.inner.instances).insert(id, slot);
        }
        Ok(())
    }

    /// Check that every plugin of `source` fits into this bus's registry.
    pub(crate) fn check_adoption(&self, source: &MessageBus) -> Result<(), PluginError> {
        let incoming = source.get_all_plugins();
        read(&self.inner.plugins).check_adopt(&incoming, source.id())
    }

    // =========================================================================
    // Readiness
    // =========================================================================

    pub fn mark_ready(&self, id: &str) {
        self.inner.readiness.mark_ready(id);
    }

    pub fn is_ready(&self, id: &str) -> bool {
        self.inner.readiness.is_ready(id)
    }

    /// Wait for `id` to become ready. `None` uses the configured timeout.
    pub async fn wait_ready(&self, id: &str, timeout: Option<Duration>) -> Result<(), ReadinessError> {
        let timeout = timeout.unwrap_or_else(|| self.inner.settings.ready_timeout());
        self.inner.readiness.wait_ready(id, timeout).await
    }

    // =========================================================================
    // Fusion
    // =========================================================================

    /// Merge this bus into `target`. This bus is retired afterwards.
    ///
    /// Rejected up front, with both buses untouched, when a plugin id is
    /// already taken on `target` or the moved plugins would pass its depth
    /// limit or resource ceiling.
    ///
    /// Callers must keep other publishers and registrations off both buses
    /// while fusion runs.
    pub async fn fuse_with(&self, target: &MessageBus, config: FusionConfig) -> FusionResult {
        FusionCoordinator::new(config).fuse(self, target).await
    }

    pub fn fusion_history(&self) -> Vec<FusionRecord> {
        self.inner
            .fusions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn record_fusion(&self, record: FusionRecord) {
        self.inner
            .fusions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }

    /// Final teardown after a fusion moved everything away.
    pub(crate) fn retire(&self) {
        self.clear();
        write(&self.inner.instances).clear();
        write(&self.inner.plugins).clear();
        self.inner.readiness.clear();
        self.inner.retired.store(true, Ordering::SeqCst);
        info!(bus = %self.inner.id, "Bus retired");
    }

    // =========================================================================
    // Stats
    // =========================================================================

    pub fn get_stats(&self) -> BusStats {
        let (subscriber_counts, total_subscribers) = {
            let subs = read(&self.inner.subscriptions);
            (subs.counts_by_category(), subs.total())
        };
        let (plugin_count, resource_usage) = {
            let plugins = read(&self.inner.plugins);
            (plugins.len(), plugins.resource_usage())
        };
        BusStats {
            bus_id: self.inner.id.clone(),
            initialized: self.is_initialized(),
            retired: self.is_retired(),
            transport: self.transport_kind(),
            subscriber_counts,
            total_subscribers,
            plugin_count,
            resource_usage,
            messages_published: self.inner.published.load(Ordering::Relaxed),
            messages_rejected: self.inner.rejected.load(Ordering::Relaxed),
            messages_delivered: self.inner.delivered.load(Ordering::Relaxed),
            batch: self.inner.batch.stats(),
            intents: self.inner.router.stats(),
            fusion_count: self.fusion_history().len(),
        }
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("id", &self.inner.id)
            .field("initialized", &self.is_initialized())
            .field("retired", &self.is_retired())
            .finish()
    }
}

/// Bus statistics snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BusStats {
    pub bus_id: String,
    pub initialized: bool,
    pub retired: bool,
    pub transport: Option<String>,
    pub subscriber_counts: BTreeMap<String, usize>,
    pub total_subscribers: usize,
    pub plugin_count: usize,
    pub resource_usage: ResourceUsage,
    pub messages_published: u64,
    pub messages_rejected: u64,
    pub messages_delivered: u64,
    pub batch: BatchStats,
    pub intents: IntentStats,
    pub fusion_count: usize,
}

/// Unsubscribe capability returned by [`MessageBus::subscribe`].
///
/// Dropping it leaves the subscription in place.
pub struct Subscription {
    bus: Weak<BusInner>,
    route: Route,
    id: SubscriptionId,
}

impl Subscription {
    /// Remove exactly this entry. Later calls are no-ops returning false.
    pub fn unsubscribe(&self) -> bool {
        match self.bus.upgrade() {
            Some(inner) => write(&inner.subscriptions).remove_id(&self.route, self.id),
            None => false,
        }
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }
}

/// A plugin's reference to the bus that currently owns it.
///
/// Shared between the plugin's context and its inbox handlers; fusion
/// repoints it at the target bus.
#[derive(Clone)]
pub struct BusLink(Arc<RwLock<Weak<BusInner>>>);

impl BusLink {
    /// A link to nothing.
    pub fn detached() -> Self {
        Self(Arc::new(RwLock::new(Weak::new())))
    }

    pub fn to(bus: &MessageBus) -> Self {
        Self(Arc::new(RwLock::new(Arc::downgrade(&bus.inner))))
    }

    pub fn bus(&self) -> Option<MessageBus> {
        read(&self.0).upgrade().map(|inner| MessageBus { inner })
    }

    pub fn repoint(&self, bus: &MessageBus) {
        *write(&self.0) = Arc::downgrade(&bus.inner);
    }
}

/// Exposes a bus's [`MessageBus::try_publish`] as a [`Transport`].
pub struct BusSink {
    bus: MessageBus,
}

impl BusSink {
    pub fn new(bus: MessageBus) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl Transport for BusSink {
    fn kind(&self) -> &str {
        "bus"
    }

    async fn send(&self, message: &Message) -> Result<usize, TransportError> {
        self.bus
            .try_publish(message.clone())
            .await
            .map_err(|e| TransportError::Rejected(e.to_string()))
    }
}

/// Routes `IntentRequest` messages published on the bus through the router.
struct InboundIntents {
    bus: Weak<BusInner>,
}

#[async_trait]
impl MessageHandler for InboundIntents {
    async fn handle(&self, message: &Message) -> anyhow::Result<()> {
        let Some(inner) = self.bus.upgrade() else {
            return Ok(());
        };
        let bus = MessageBus { inner };
        let mut options = SendIntentOptions::default().with_correlation_id(message.id());
        if let Some(source) = message.source() {
            options = options.with_source(source);
        }
        // Failures are answered with an error response; nothing to propagate.
        if let Err(e) = bus
            .send_intent_with(message.topic(), message.payload().clone(), options)
            .await
        {
            debug!(bus = %bus.id(), intent = %message.topic(), error = %e, "Inbound intent failed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::{handler_fn, ChannelTransport};
    use crate::plugins::CounterPlugin;
    use std::sync::atomic::AtomicUsize;

    fn counting_handler(count: Arc<AtomicUsize>) -> ArcHandler {
        handler_fn(move |_msg| {
            let count = count.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    fn recording_handler(log: Arc<Mutex<Vec<String>>>, tag: &'static str) -> ArcHandler {
        handler_fn(move |_msg| {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(tag.to_string());
                Ok(())
            }
        })
    }

    fn ping() -> Message {
        Message::notice("test.ping", Value::Null)
    }

    // =========================================================================
    // Publish / Subscribe
    // =========================================================================

    #[tokio::test]
    async fn test_ping_scenario() {
        let bus = MessageBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let _sub = bus.subscribe(
            Route::topic(Category::Notice, "test.ping"),
            counting_handler(count.clone()),
        );

        assert_eq!(bus.publish(ping()).await, 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalid_message_returns_zero() {
        let bus = MessageBus::new();
        assert_eq!(bus.publish(Message::default()).await, 0);
        assert!(matches!(
            bus.try_publish(Message::default()).await,
            Err(BusError::InvalidMessage(_))
        ));
        assert_eq!(bus.get_stats().messages_rejected, 2);
    }

    #[tokio::test]
    async fn test_delivery_follows_subscription_order() {
        let bus = MessageBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let route = Route::topic(Category::Notice, "test.ping");
        bus.subscribe(route.clone(), recording_handler(log.clone(), "h1"));
        bus.subscribe(Category::Notice, recording_handler(log.clone(), "wild"));
        bus.subscribe(route, recording_handler(log.clone(), "h3"));

        assert_eq!(bus.publish(ping()).await, 3);
        assert_eq!(*log.lock().unwrap(), vec!["h1", "wild", "h3"]);
    }

    #[tokio::test]
    async fn test_handler_failure_is_isolated() {
        let bus = MessageBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let route = Route::topic(Category::Notice, "test.ping");
        bus.subscribe(
            route.clone(),
            handler_fn(|_msg| async { anyhow::bail!("boom") }),
        );
        bus.subscribe(route, counting_handler(count.clone()));

        assert_eq!(bus.publish(ping()).await, 2);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let bus = MessageBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let handler = counting_handler(count.clone());
        let route = Route::topic(Category::Notice, "test.ping");
        let first = bus.subscribe(route.clone(), handler.clone());
        bus.subscribe(route.clone(), handler.clone());

        assert_eq!(bus.publish(ping()).await, 2);
        assert!(first.unsubscribe());
        assert!(!first.unsubscribe());
        assert_eq!(bus.publish(ping()).await, 1);
        assert!(bus.unsubscribe(&route, &handler));
        assert!(!bus.unsubscribe(&route, &handler));
        assert_eq!(bus.publish(ping()).await, 0);
        assert_eq!(bus.subscriber_count(&route), 0);
    }

    #[tokio::test]
    async fn test_clear_resets_and_reinitializes() {
        let bus = MessageBus::new();
        bus.subscribe(Category::Notice, counting_handler(Arc::new(AtomicUsize::new(0))));
        assert!(bus.is_initialized());

        bus.clear();
        bus.clear();
        assert!(!bus.is_initialized());
        assert_eq!(bus.get_stats().total_subscribers, 0);

        bus.publish(ping()).await;
        assert!(bus.is_initialized());
    }

    #[tokio::test]
    async fn test_reentrant_publish_from_handler() {
        let bus = MessageBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        bus.subscribe(
            Route::topic(Category::Notice, "test.pong"),
            counting_handler(count.clone()),
        );
        let link = BusLink::to(&bus);
        bus.subscribe(
            Route::topic(Category::Notice, "test.ping"),
            handler_fn(move |_msg| {
                let link = link.clone();
                async move {
                    if let Some(bus) = link.bus() {
                        bus.publish(Message::notice("test.pong", Value::Null)).await;
                    }
                    Ok(())
                }
            }),
        );

        bus.publish(ping()).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    // =========================================================================
    // Transport
    // =========================================================================

    #[tokio::test]
    async fn test_transport_receives_after_local_fanout() {
        let transport = Arc::new(ChannelTransport::new(8));
        let mut rx = transport.subscribe();
        let bus = MessageBus::builder().transport(transport.clone()).build();

        assert_eq!(bus.publish(ping()).await, 0);
        let got = rx.try_recv().unwrap().unwrap();
        assert_eq!(got.topic(), "test.ping");
        assert_eq!(bus.transport_kind().as_deref(), Some("channel"));
    }

    #[tokio::test]
    async fn test_transport_failure_is_discriminated() {
        // No receivers: the channel reports Closed.
        let bus = MessageBus::builder()
            .transport(Arc::new(ChannelTransport::new(8)))
            .build();
        let count = Arc::new(AtomicUsize::new(0));
        bus.subscribe(Category::Notice, counting_handler(count.clone()));

        match bus.try_publish(ping()).await {
            Err(BusError::Transport { delivered, .. }) => assert_eq!(delivered, 1),
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(bus.publish(ping()).await, 1);
    }

    // =========================================================================
    // Intents
    // =========================================================================

    #[tokio::test]
    async fn test_intent_response_is_correlated() {
        let bus = MessageBus::new();
        let responses = Arc::new(Mutex::new(Vec::new()));
        let sink = responses.clone();
        bus.subscribe(
            Category::IntentResponse,
            handler_fn(move |msg| {
                let sink = sink.clone();
                async move {
                    sink.lock().unwrap().push(msg);
                    Ok(())
                }
            }),
        );

        bus.send_intent_with(
            "system.boot.status",
            Value::Null,
            SendIntentOptions::default().with_correlation_id("req-1"),
        )
        .await
        .unwrap();
        let _ = bus
            .send_intent_with(
                "system.nope",
                Value::Null,
                SendIntentOptions::default().with_correlation_id("req-2"),
            )
            .await;

        let got = responses.lock().unwrap().clone();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].correlation_id(), Some("req-1"));
        assert!(got[0].payload().get("error").is_none());
        assert_eq!(got[1].correlation_id(), Some("req-2"));
        assert_eq!(got[1].payload()["correlationId"], "req-2");
        assert!(got[1].payload()["error"].is_string());
    }

    #[tokio::test]
    async fn test_missing_intent_name() {
        let bus = MessageBus::new();
        assert!(matches!(
            bus.send_intent("", Value::Null).await,
            Err(IntentError::MissingIntent)
        ));
    }

    #[tokio::test]
    async fn test_inbound_intent_request_is_routed() {
        let bus = MessageBus::new();
        let responses = Arc::new(Mutex::new(Vec::new()));
        let sink = responses.clone();
        bus.subscribe(
            Category::IntentResponse,
            handler_fn(move |msg| {
                let sink = sink.clone();
                async move {
                    sink.lock().unwrap().push(msg);
                    Ok(())
                }
            }),
        );

        let request = Message::intent_request("system.plugin.create", json!({ "type": "echo", "id": "e" }));
        let request_id = request.id().to_string();
        bus.publish(request).await;

        assert!(bus.get_plugin("e").is_some());
        let got = responses.lock().unwrap().clone();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].correlation_id(), Some(request_id.as_str()));
    }

    #[tokio::test]
    async fn test_inbound_routing_can_be_disabled() {
        let settings = BusSettings {
            route_inbound_intents: false,
            ..BusSettings::default()
        };
        let bus = MessageBus::builder().settings(settings).build();
        let request = Message::intent_request("system.plugin.create", json!({ "type": "echo", "id": "e" }));
        assert_eq!(bus.publish(request).await, 0);
        assert!(bus.get_plugin("e").is_none());
    }

    // =========================================================================
    // Plugins
    // =========================================================================

    #[tokio::test]
    async fn test_create_plugin_subscribes_interests() {
        let bus = MessageBus::new();
        let record = bus
            .create_plugin(PluginSpec::new("counter").with_id("c"))
            .await
            .unwrap();
        assert_eq!(record.kind, "counter");

        bus.publish(ping()).await;
        bus.publish(ping()).await;
        // The counter ignores its own plugin.initialized notice.
        let desc = bus.describe_plugin("c").unwrap();
        assert_eq!(desc["count"], 2);
    }

    #[tokio::test]
    async fn test_destroy_removes_plugin_subscriptions() {
        let bus = MessageBus::new();
        bus.create_plugin(PluginSpec::new("counter").with_id("c"))
            .await
            .unwrap();
        let before = bus.get_stats().total_subscribers;
        bus.destroy_plugin("c", false).await.unwrap();
        assert_eq!(bus.get_stats().total_subscribers, before - 1);
        assert!(bus.plugin_instance("c").is_none());
    }

    #[tokio::test]
    async fn test_register_and_unregister_plugin() {
        let bus = MessageBus::new();
        assert!(bus.register_plugin(PluginRecord::new("a", "node")));
        assert!(!bus.register_plugin(PluginRecord::new("a", "node")));
        assert!(bus.register_plugin(PluginRecord::new("b", "node").with_parent("a")));

        assert!(!bus.unregister_plugin("a").await);
        assert!(bus.unregister_plugin("b").await);
        assert!(bus.unregister_plugin("a").await);
        assert!(!bus.unregister_plugin("a").await);
    }

    #[tokio::test]
    async fn test_resource_symmetry_through_bus() {
        let settings = BusSettings::default().with_resource_ceiling(10);
        let bus = MessageBus::builder().settings(settings).build();
        bus.create_plugin(PluginSpec::new("echo").with_id("a").with_resource_cost(6))
            .await
            .unwrap();
        let err = bus
            .create_plugin(PluginSpec::new("echo").with_id("b").with_resource_cost(5))
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::InsufficientResources { .. }));
        assert!(bus.get_plugin("b").is_none());

        bus.destroy_plugin("a", false).await.unwrap();
        bus.create_plugin(PluginSpec::new("echo").with_id("b").with_resource_cost(10))
            .await
            .unwrap();
        assert_eq!(bus.resource_usage().total, 10);
    }

    #[tokio::test]
    async fn test_reparent_emits_notice() {
        let bus = MessageBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        bus.subscribe(
            Route::topic(Category::Notice, "plugin.reparented"),
            counting_handler(count.clone()),
        );
        bus.register_plugin(PluginRecord::new("a", "node"));
        bus.register_plugin(PluginRecord::new("b", "node"));

        bus.reparent_plugin("b", Some("a")).await.unwrap();
        assert!(bus.reparent_plugin("a", Some("a")).await.is_err());
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.get_ancestors("b"), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_plugin_context_follows_link() {
        let bus = MessageBus::new();
        bus.attach_plugin(PluginRecord::new("c", "counter"), Arc::new(CounterPlugin::new()))
            .await
            .unwrap();
        let other = MessageBus::new();
        let ctx = PluginContext::new("c", BusLink::to(&bus));
        ctx.link().repoint(&other);
        assert!(ctx.bus().unwrap().same_bus(&other));
    }

    // =========================================================================
    // Batch / Stats
    // =========================================================================

    #[tokio::test]
    async fn test_publish_batch_delivers_locally() {
        let bus = MessageBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        bus.subscribe(Category::Notice, counting_handler(count.clone()));

        let result = bus
            .publish_batch(vec![
                Message::notice("log.debug", Value::Null),
                Message::notice("app.a", Value::Null),
            ])
            .await
            .unwrap();
        assert_eq!(result.processed_count, 2);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_publish_batch_invalid_sequential_item_fails() {
        let bus = MessageBus::new();
        let err = bus
            .publish_batch(vec![Message::default()])
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::Sequential { index: 0, .. }));
    }

    #[tokio::test]
    async fn test_stats_shape() {
        let bus = MessageBus::builder().id("bus-x").build();
        bus.publish(ping()).await;
        let stats = serde_json::to_value(bus.get_stats()).unwrap();
        assert_eq!(stats["busId"], "bus-x");
        assert_eq!(stats["messagesPublished"], 1);
        assert!(stats["subscriberCounts"].is_object());
        assert!(stats["resourceUsage"]["byOwner"].is_object());
    }
}
