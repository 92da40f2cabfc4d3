//! Prefix routing table with per-route statistics.

use super::{ForwardIntents, IntentCall, IntentError, IntentHandler, PluginIntents, SystemIntents};
use crate::messaging::MessageBus;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Instant;
use tracing::debug;

const FALLBACK_ROUTE: &str = "forwarded";

/// A settled intent, kept in the bounded history.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentRecord {
    pub intent: String,
    pub correlation_id: String,
    pub route: String,
    pub success: bool,
    pub duration_ms: f64,
    pub timestamp: DateTime<Utc>,
}

/// Totals across every routed intent.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentStats {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Keyed by route prefix, or "forwarded" for the fallback.
    pub by_route: BTreeMap<String, u64>,
    pub recent: Vec<IntentRecord>,
}

#[derive(Default)]
struct IntentLog {
    total: u64,
    succeeded: u64,
    failed: u64,
    by_route: BTreeMap<String, u64>,
    recent: VecDeque<IntentRecord>,
}

/// Longest-prefix intent dispatch.
pub struct IntentRouter {
    routes: RwLock<Vec<(String, Arc<dyn IntentHandler>)>>,
    fallback: Arc<dyn IntentHandler>,
    log: Mutex<IntentLog>,
    history_limit: usize,
}

impl IntentRouter {
    /// Router with the `system.` and `plugin.` routes and the forwarding fallback.
    pub fn new(history_limit: usize) -> Self {
        let router = Self {
            routes: RwLock::new(Vec::new()),
            fallback: Arc::new(ForwardIntents),
            log: Mutex::new(IntentLog::default()),
            history_limit,
        };
        router.register_route("system.", Arc::new(SystemIntents));
        router.register_route("plugin.", Arc::new(PluginIntents));
        router
    }

    /// Add or replace the handler for `prefix`.
    pub fn register_route(&self, prefix: impl Into<String>, handler: Arc<dyn IntentHandler>) {
        let prefix = prefix.into();
        let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);
        match routes.iter_mut().find(|(p, _)| *p == prefix) {
            Some(slot) => slot.1 = handler,
            None => routes.push((prefix, handler)),
        }
    }

    /// Registered prefixes, longest first.
    pub fn prefixes(&self) -> Vec<String> {
        let routes = self.routes.read().unwrap_or_else(PoisonError::into_inner);
        let mut prefixes: Vec<String> = routes.iter().map(|(p, _)| p.clone()).collect();
        prefixes.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        prefixes
    }

    /// The route label and handler `name` resolves to.
    pub fn resolve(&self, name: &str) -> (String, Arc<dyn IntentHandler>) {
        let routes = self.routes.read().unwrap_or_else(PoisonError::into_inner);
        routes
            .iter()
            .filter(|(prefix, _)| name.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(prefix, handler)| (prefix.clone(), handler.clone()))
            .unwrap_or_else(|| (FALLBACK_ROUTE.to_string(), self.fallback.clone()))
    }

    /// Dispatch `call` and record the outcome.
    pub async fn route(&self, bus: &MessageBus, call: &IntentCall) -> Result<Value, IntentError> {
        if call.name.is_empty() {
            return Err(IntentError::MissingIntent);
        }

        let (route, handler) = self.resolve(&call.name);
        debug!(intent = %call.name, route = %route, correlation_id = %call.correlation_id, "Routing intent");

        let started = Instant::now();
        let result = handler.handle(bus, call).await;
        self.record(IntentRecord {
            intent: call.name.clone(),
            correlation_id: call.correlation_id.clone(),
            route,
            success: result.is_ok(),
            duration_ms: started.elapsed().as_secs_f64() * 1000.0,
            timestamp: Utc::now(),
        });
        result
    }

    fn record(&self, record: IntentRecord) {
        let mut log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
        log.total += 1;
        if record.success {
            log.succeeded += 1;
        } else {
            log.failed += 1;
        }
        *log.by_route.entry(record.route.clone()).or_insert(0) += 1;
        log.recent.push_back(record);
        while log.recent.len() > self.history_limit {
            log.recent.pop_front();
        }
    }

    pub fn stats(&self) -> IntentStats {
        let log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
        IntentStats {
            total: log.total,
            succeeded: log.succeeded,
            failed: log.failed,
            by_route: log.by_route.clone(),
            recent: log.recent.iter().cloned().collect(),
        }
    }

    pub fn reset_stats(&self) {
        *self.log.lock().unwrap_or_else(PoisonError::into_inner) = IntentLog::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    struct Fixed(&'static str);

    #[async_trait]
    impl IntentHandler for Fixed {
        async fn handle(&self, _bus: &MessageBus, _call: &IntentCall) -> Result<Value, IntentError> {
            Ok(json!(self.0))
        }
    }

    fn call(name: &str) -> IntentCall {
        IntentCall {
            name: name.into(),
            payload: Value::Null,
            correlation_id: "c".into(),
            source: None,
        }
    }

    #[test]
    fn test_default_routes() {
        let router = IntentRouter::new(10);
        assert_eq!(router.resolve("system.stats").0, "system.");
        assert_eq!(router.resolve("plugin.echo").0, "plugin.");
        assert_eq!(router.resolve("app.save").0, "forwarded");
    }

    #[test]
    fn test_longest_prefix_wins() {
        let router = IntentRouter::new(10);
        router.register_route("system.custom.", Arc::new(Fixed("custom")));
        assert_eq!(router.resolve("system.custom.go").0, "system.custom.");
        assert_eq!(router.resolve("system.stats").0, "system.");
        assert_eq!(router.prefixes()[0], "system.custom.");
    }

    #[tokio::test]
    async fn test_route_records_stats() {
        let bus = MessageBus::new();
        let router = IntentRouter::new(2);
        router.register_route("app.", Arc::new(Fixed("ok")));

        for _ in 0..3 {
            assert_eq!(router.route(&bus, &call("app.run")).await.unwrap(), json!("ok"));
        }
        assert!(router.route(&bus, &call("system.nope")).await.is_err());

        let stats = router.stats();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.succeeded, 3);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.by_route.get("app."), Some(&3));
        assert_eq!(stats.recent.len(), 2);
        assert_eq!(stats.recent[1].intent, "system.nope");

        router.reset_stats();
        assert_eq!(router.stats().total, 0);
    }

    #[tokio::test]
    async fn test_empty_name_is_missing_intent() {
        let bus = MessageBus::new();
        let router = IntentRouter::new(10);
        let err = router.route(&bus, &call("")).await.unwrap_err();
        assert!(matches!(err, IntentError::MissingIntent));
        assert_eq!(router.stats().total, 0);
    }
}
