//! Subscription registry: per-route ordered handler lists.

use super::{Category, Message};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// A subscriber callback.
///
/// Errors are caught by the bus, logged and isolated from sibling handlers.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &Message) -> anyhow::Result<()>;
}

/// Shared handler. Identity (for unsubscribe and fusion dedup) is the `Arc` allocation.
pub type ArcHandler = Arc<dyn MessageHandler>;

struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, message: &Message) -> anyhow::Result<()> {
        (self.f)(message.clone()).await
    }
}

/// Wrap an async closure as a handler.
///
/// ```ignore
/// let handler = handler_fn(|msg| async move {
///     println!("{}", msg.topic());
///     Ok(())
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> ArcHandler
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

/// Whether two handles point at the same handler.
pub fn same_handler(a: &ArcHandler, b: &ArcHandler) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// What a handler is subscribed to: a category plus an exact topic, or the
/// whole category when `topic` is `None`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Route {
    pub category: Category,
    pub topic: Option<String>,
}

impl Route {
    /// Every message of the category.
    pub fn all(category: Category) -> Self {
        Self {
            category,
            topic: None,
        }
    }

    /// Messages of the category with exactly this topic.
    pub fn topic(category: Category, topic: impl Into<String>) -> Self {
        Self {
            category,
            topic: Some(topic.into()),
        }
    }

    pub fn is_wildcard(&self) -> bool {
        self.topic.is_none()
    }
}

impl From<Category> for Route {
    fn from(category: Category) -> Self {
        Route::all(category)
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.topic {
            Some(topic) => write!(f, "{}/{}", self.category, topic),
            None => write!(f, "{}/*", self.category),
        }
    }
}

/// Monotonic subscription id. Lower ids were subscribed earlier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

/// Who installed a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionOrigin {
    User,
    /// Installed by the bus itself; never merged into another bus.
    System,
    /// Owned by a plugin; removed when the plugin is destroyed.
    Plugin(String),
}

#[derive(Clone)]
struct Entry {
    id: SubscriptionId,
    handler: ArcHandler,
    origin: SubscriptionOrigin,
}

/// A `(route, handler, origin)` triple exported for merging.
#[derive(Clone)]
pub struct ExportedSubscription {
    pub route: Route,
    pub handler: ArcHandler,
    pub origin: SubscriptionOrigin,
}

/// Ordered handler lists keyed by route.
#[derive(Default)]
pub struct SubscriptionRegistry {
    routes: HashMap<Route, Vec<Entry>>,
    next_id: u64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler to the route's list.
    pub fn add(
        &mut self,
        route: Route,
        handler: ArcHandler,
        origin: SubscriptionOrigin,
    ) -> SubscriptionId {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.routes.entry(route).or_default().push(Entry {
            id,
            handler,
            origin,
        });
        id
    }

    /// Remove exactly one subscription by id.
    pub fn remove_id(&mut self, route: &Route, id: SubscriptionId) -> bool {
        self.remove_where(route, |entry| entry.id == id)
    }

    /// Remove the earliest subscription of `handler` on the route.
    pub fn remove_handler(&mut self, route: &Route, handler: &ArcHandler) -> bool {
        self.remove_where(route, |entry| same_handler(&entry.handler, handler))
    }

    fn remove_where(&mut self, route: &Route, pred: impl Fn(&Entry) -> bool) -> bool {
        let Some(entries) = self.routes.get_mut(route) else {
            return false;
        };
        let Some(pos) = entries.iter().position(pred) else {
            return false;
        };
        entries.remove(pos);
        if entries.is_empty() {
            self.routes.remove(route);
        }
        true
    }

    /// Remove every subscription installed by `origin`. Returns how many went.
    pub fn remove_origin(&mut self, origin: &SubscriptionOrigin) -> usize {
        let mut removed = 0;
        self.routes.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|entry| &entry.origin != origin);
            removed += before - entries.len();
            !entries.is_empty()
        });
        removed
    }

    /// Handlers for a message, exact-topic and wildcard entries merged in
    /// subscription order.
    pub fn handlers_for(&self, category: Category, topic: &str) -> Vec<ArcHandler> {
        let exact = self.routes.get(&Route::topic(category, topic));
        let wildcard = self.routes.get(&Route::all(category));

        let mut matched: Vec<&Entry> = exact
            .into_iter()
            .flatten()
            .chain(wildcard.into_iter().flatten())
            .collect();
        matched.sort_by_key(|entry| entry.id);
        matched.into_iter().map(|e| e.handler.clone()).collect()
    }

    /// Whether this exact handler is already subscribed on the route.
    pub fn contains(&self, route: &Route, handler: &ArcHandler) -> bool {
        self.routes
            .get(route)
            .map(|entries| entries.iter().any(|e| same_handler(&e.handler, handler)))
            .unwrap_or(false)
    }

    /// Non-system subscriptions in subscription order.
    pub fn export(&self) -> Vec<ExportedSubscription> {
        let mut entries: Vec<(&Route, &Entry)> = self
            .routes
            .iter()
            .flat_map(|(route, entries)| entries.iter().map(move |e| (route, e)))
            .filter(|(_, e)| e.origin != SubscriptionOrigin::System)
            .collect();
        entries.sort_by_key(|(_, e)| e.id);
        entries
            .into_iter()
            .map(|(route, e)| ExportedSubscription {
                route: route.clone(),
                handler: e.handler.clone(),
                origin: e.origin.clone(),
            })
            .collect()
    }

    /// Union `incoming` into this registry. Pairs already present are skipped.
    /// Returns the number of subscriptions added.
    pub fn merge(&mut self, incoming: Vec<ExportedSubscription>) -> usize {
        let mut added = 0;
        for sub in incoming {
            if self.contains(&sub.route, &sub.handler) {
                continue;
            }
            self.add(sub.route, sub.handler, sub.origin);
            added += 1;
        }
        added
    }

    pub fn subscriber_count(&self, route: &Route) -> usize {
        self.routes.get(route).map(Vec::len).unwrap_or(0)
    }

    /// Subscriber counts keyed by category name.
    pub fn counts_by_category(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for (route, entries) in &self.routes {
            *counts.entry(route.category.to_string()).or_insert(0) += entries.len();
        }
        counts
    }

    pub fn total(&self) -> usize {
        self.routes.values().map(Vec::len).sum()
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn clear(&mut self) {
        self.routes.clear();
    }
}
