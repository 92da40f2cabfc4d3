//! Plugin registry: identity, parent/child hierarchy and lifecycle state.
//!
//! The registry is plain data. It never calls into plugin instances or the
//! bus; the bus wraps it, emits lifecycle notices and owns the instances.
//!
//! Every write operation validates first and mutates last, so a rejected
//! call leaves the registry exactly as it was.

use super::resources::{ResourceLedger, ResourceUsage};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, warn};

/// Lifecycle state of a registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginStatus {
    Active,
    Destroyed,
}

/// A plugin as the registry sees it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub display_name: String,
    pub parent_id: Option<String>,
    pub status: PluginStatus,
    pub metadata: Value,
    /// Cost declared at creation.
    pub resource_cost: u64,
    /// Identity the cost was charged to. `None` when nothing was charged.
    pub resource_owner: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl PluginRecord {
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            display_name: id.clone(),
            id,
            kind: kind.into(),
            parent_id: None,
            status: PluginStatus::Active,
            metadata: Value::Null,
            resource_cost: 0,
            resource_owner: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_resource_cost(mut self, cost: u64) -> Self {
        self.resource_cost = cost;
        self
    }
}

/// Plugin registry errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PluginError {
    #[error("Plugin already registered: {0}")]
    DuplicateId(String),

    #[error("Plugin is missing required field: {0}")]
    MissingField(&'static str),

    #[error("Plugin not found: {0}")]
    NotFound(String),

    #[error("Parent plugin not found: {0}")]
    ParentNotFound(String),

    #[error("Circular reference: {parent} cannot become the parent of {id}")]
    CircularReference { id: String, parent: String },

    #[error("Maximum hierarchy depth exceeded: level {level} > {max}")]
    MaxDepthExceeded { level: usize, max: usize },

    #[error("Insufficient resources for {owner}: requested {requested}, available {available}")]
    InsufficientResources {
        owner: String,
        requested: u64,
        available: u64,
    },

    #[error("Plugin {id} still has {count} children")]
    HasChildren { id: String, count: usize },

    #[error("Unknown plugin type: {0}")]
    UnknownPluginType(String),

    #[error("Plugin factory failed: {0}")]
    Factory(String),
}

/// Limits the registry enforces.
#[derive(Debug, Clone)]
pub struct RegistryLimits {
    pub max_depth: usize,
    pub max_traversal_depth: usize,
    pub resource_ceiling: u64,
}

impl Default for RegistryLimits {
    fn default() -> Self {
        Self {
            max_depth: 10,
            max_traversal_depth: 100,
            resource_ceiling: 100,
        }
    }
}

/// One node of [`PluginRegistry::tree`].
#[derive(Debug, Clone, Serialize)]
pub struct PluginTreeNode {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub level: usize,
    pub children: Vec<PluginTreeNode>,
}

/// A problem found by [`PluginRegistry::validate_integrity`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IntegrityIssue {
    MissingParent { id: String, parent_id: String },
    CircularReference { id: String },
    DepthViolation { id: String, level: usize, max: usize },
}

/// Insertion-ordered plugin store with hierarchy indexes and a resource ledger.
pub struct PluginRegistry {
    limits: RegistryLimits,
    /// Charged for root plugins (the owning bus id).
    root_owner: String,
    order: Vec<String>,
    records: HashMap<String, PluginRecord>,
    children: HashMap<String, Vec<String>>,
    by_type: HashMap<String, Vec<String>>,
    ledger: ResourceLedger,
}

impl PluginRegistry {
    pub fn new(root_owner: impl Into<String>, limits: RegistryLimits) -> Self {
        let ledger = ResourceLedger::new(limits.resource_ceiling);
        Self {
            limits,
            root_owner: root_owner.into(),
            order: Vec::new(),
            records: HashMap::new(),
            children: HashMap::new(),
            by_type: HashMap::new(),
            ledger,
        }
    }

    pub fn limits(&self) -> &RegistryLimits {
        &self.limits
    }

    pub fn root_owner(&self) -> &str {
        &self.root_owner
    }

    /// Add a record as-is. No depth or resource checks.
    pub fn register(&mut self, record: PluginRecord) -> Result<(), PluginError> {
        if record.id.is_empty() {
            return Err(PluginError::MissingField("id"));
        }
        if record.kind.is_empty() {
            return Err(PluginError::MissingField("type"));
        }
        if self.records.contains_key(&record.id) {
            return Err(PluginError::DuplicateId(record.id));
        }
        if let Some(parent) = &record.parent_id {
            if !self.records.contains_key(parent) {
                return Err(PluginError::ParentNotFound(parent.clone()));
            }
        }

        self.insert(record);
        Ok(())
    }

    /// Register with depth enforcement and resource accounting.
    ///
    /// The cost is charged to the parent, or to the registry's root owner for
    /// a root plugin.
    pub fn create(&mut self, mut record: PluginRecord) -> Result<(), PluginError> {
        if record.id.is_empty() {
            return Err(PluginError::MissingField("id"));
        }
        if record.kind.is_empty() {
            return Err(PluginError::MissingField("type"));
        }
        if self.records.contains_key(&record.id) {
            return Err(PluginError::DuplicateId(record.id));
        }

        let level = match &record.parent_id {
            Some(parent) => {
                if !self.records.contains_key(parent) {
                    return Err(PluginError::ParentNotFound(parent.clone()));
                }
                self.get_level(parent) + 1
            }
            None => 0,
        };
        if level > self.limits.max_depth {
            return Err(PluginError::MaxDepthExceeded {
                level,
                max: self.limits.max_depth,
            });
        }

        let owner = record
            .parent_id
            .clone()
            .unwrap_or_else(|| self.root_owner.clone());
        if !self.ledger.can_afford(&owner, record.resource_cost) {
            return Err(PluginError::InsufficientResources {
                requested: record.resource_cost,
                available: self
                    .ledger
                    .ceiling()
                    .saturating_sub(self.ledger.usage(&owner)),
                owner,
            });
        }

        self.ledger.charge(&owner, record.resource_cost);
        record.resource_owner = Some(owner);
        self.insert(record);
        Ok(())
    }

    fn insert(&mut self, record: PluginRecord) {
        debug!(plugin = %record.id, kind = %record.kind, parent = ?record.parent_id, "Plugin registered");
        if let Some(parent) = &record.parent_id {
            self.children
                .entry(parent.clone())
                .or_default()
                .push(record.id.clone());
        }
        self.by_type
            .entry(record.kind.clone())
            .or_default()
            .push(record.id.clone());
        self.order.push(record.id.clone());
        self.records.insert(record.id.clone(), record);
    }

    /// Remove a childless plugin. Its charge goes back to the ledger.
    pub fn unregister(&mut self, id: &str) -> Result<PluginRecord, PluginError> {
        if !self.records.contains_key(id) {
            return Err(PluginError::NotFound(id.to_string()));
        }
        let count = self.children.get(id).map(Vec::len).unwrap_or(0);
        if count > 0 {
            return Err(PluginError::HasChildren {
                id: id.to_string(),
                count,
            });
        }
        self.remove(id)
            .ok_or_else(|| PluginError::NotFound(id.to_string()))
    }

    /// Remove `id` and its whole subtree, deepest first.
    pub fn unregister_cascade(&mut self, id: &str) -> Result<Vec<PluginRecord>, PluginError> {
        if !self.records.contains_key(id) {
            return Err(PluginError::NotFound(id.to_string()));
        }

        let mut doomed: Vec<(usize, String)> = self
            .get_descendants(id)
            .into_iter()
            .map(|d| (self.get_level(&d), d))
            .collect();
        // Stable sort keeps sibling order within a level.
        doomed.sort_by(|a, b| b.0.cmp(&a.0));

        let mut removed: Vec<PluginRecord> = doomed
            .into_iter()
            .filter_map(|(_, d)| self.remove(&d))
            .collect();
        if let Some(record) = self.remove(id) {
            removed.push(record);
        }
        Ok(removed)
    }

    fn remove(&mut self, id: &str) -> Option<PluginRecord> {
        let mut record = self.records.remove(id)?;
        self.order.retain(|o| o != id);
        if let Some(parent) = &record.parent_id {
            if let Some(siblings) = self.children.get_mut(parent) {
                siblings.retain(|c| c != id);
                if siblings.is_empty() {
                    self.children.remove(parent);
                }
            }
        }
        self.children.remove(id);
        if let Some(ids) = self.by_type.get_mut(&record.kind) {
            ids.retain(|c| c != id);
            if ids.is_empty() {
                self.by_type.remove(&record.kind);
            }
        }
        if let Some(owner) = &record.resource_owner {
            self.ledger.release(owner, record.resource_cost);
        }
        record.status = PluginStatus::Destroyed;
        debug!(plugin = %id, "Plugin unregistered");
        Some(record)
    }

    /// Move `id` under `new_parent` (or to the root level with `None`).
    ///
    /// Returns the previous parent.
    pub fn reparent(
        &mut self,
        id: &str,
        new_parent: Option<&str>,
    ) -> Result<Option<String>, PluginError> {
        if let Some(parent) = new_parent {
            if parent == id {
                return Err(PluginError::CircularReference {
                    id: id.to_string(),
                    parent: parent.to_string(),
                });
            }
        }
        if !self.records.contains_key(id) {
            return Err(PluginError::NotFound(id.to_string()));
        }

        let parent_level = match new_parent {
            Some(parent) => {
                if !self.records.contains_key(parent) {
                    return Err(PluginError::ParentNotFound(parent.to_string()));
                }
                if self.would_create_cycle(id, parent) {
                    return Err(PluginError::CircularReference {
                        id: id.to_string(),
                        parent: parent.to_string(),
                    });
                }
                Some(self.get_level(parent))
            }
            None => None,
        };

        let new_level = parent_level.map(|l| l + 1).unwrap_or(0);
        let deepest = new_level + self.subtree_height(id);
        if deepest > self.limits.max_depth {
            return Err(PluginError::MaxDepthExceeded {
                level: deepest,
                max: self.limits.max_depth,
            });
        }

        let old_parent = self.records.get(id).and_then(|r| r.parent_id.clone());
        if let Some(old) = &old_parent {
            if let Some(siblings) = self.children.get_mut(old) {
                siblings.retain(|c| c != id);
                if siblings.is_empty() {
                    self.children.remove(old);
                }
            }
        }
        if let Some(parent) = new_parent {
            self.children
                .entry(parent.to_string())
                .or_default()
                .push(id.to_string());
        }
        if let Some(record) = self.records.get_mut(id) {
            record.parent_id = new_parent.map(str::to_string);
        }
        debug!(plugin = %id, from = ?old_parent, to = ?new_parent, "Plugin reparented");
        Ok(old_parent)
    }

    /// Both halves must agree there is no cycle: the bounded ancestor walk
    /// from the candidate parent, and the full descendant set of `id`.
    fn would_create_cycle(&self, id: &str, new_parent: &str) -> bool {
        let mut visited = HashSet::new();
        let mut current = Some(new_parent.to_string());
        let mut hops = 0;
        while let Some(node) = current {
            if hops >= self.limits.max_traversal_depth {
                break;
            }
            if node == id || !visited.insert(node.clone()) {
                return true;
            }
            current = self.records.get(&node).and_then(|r| r.parent_id.clone());
            hops += 1;
        }

        self.get_descendants(id).iter().any(|d| d == new_parent)
    }

    /// Levels below `id` in its subtree (0 for a leaf).
    fn subtree_height(&self, id: &str) -> usize {
        let base = self.get_level(id);
        self.get_descendants(id)
            .iter()
            .map(|d| self.get_level(d).saturating_sub(base))
            .max()
            .unwrap_or(0)
    }

    pub fn get(&self, id: &str) -> Option<&PluginRecord> {
        self.records.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut PluginRecord> {
        self.records.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// All records in registration order.
    pub fn all(&self) -> Vec<&PluginRecord> {
        self.order.iter().filter_map(|id| self.records.get(id)).collect()
    }

    pub fn by_type(&self, kind: &str) -> Vec<&PluginRecord> {
        self.by_type
            .get(kind)
            .map(|ids| ids.iter().filter_map(|id| self.records.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn get_parent(&self, id: &str) -> Option<String> {
        self.records.get(id).and_then(|r| r.parent_id.clone())
    }

    pub fn get_children(&self, id: &str) -> Vec<String> {
        self.children.get(id).cloned().unwrap_or_default()
    }

    /// Breadth-first descendants. Terminates on a corrupted hierarchy.
    pub fn get_descendants(&self, id: &str) -> Vec<String> {
        let mut visited: HashSet<&str> = HashSet::new();
        visited.insert(id);
        let mut out = Vec::new();
        let mut frontier = vec![id];
        while !frontier.is_empty() {
            let mut next = Vec::new();
            for node in frontier {
                for child in self.children.get(node).into_iter().flatten() {
                    if visited.insert(child.as_str()) {
                        out.push(child.clone());
                        next.push(child.as_str());
                    }
                }
            }
            frontier = next;
        }
        out
    }

    /// Parent first, root last. Stops at a revisited node or the hop limit.
    pub fn get_ancestors(&self, id: &str) -> Vec<String> {
        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(id.to_string());
        let mut out = Vec::new();
        let mut current = self.records.get(id).and_then(|r| r.parent_id.clone());
        while let Some(parent) = current {
            if out.len() >= self.limits.max_traversal_depth || !visited.insert(parent.clone()) {
                break;
            }
            current = self.records.get(&parent).and_then(|r| r.parent_id.clone());
            out.push(parent);
        }
        out
    }

    /// Other children of `id`'s parent. Root plugins are siblings of each other.
    pub fn get_siblings(&self, id: &str) -> Vec<String> {
        let Some(record) = self.records.get(id) else {
            return Vec::new();
        };
        let peers = match &record.parent_id {
            Some(parent) => self.get_children(parent),
            None => self.roots(),
        };
        peers.into_iter().filter(|p| p != id).collect()
    }

    /// Root = 0.
    pub fn get_level(&self, id: &str) -> usize {
        self.get_ancestors(id).len()
    }

    pub fn roots(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| {
                self.records
                    .get(*id)
                    .map(|r| r.parent_id.is_none())
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    pub fn tree(&self) -> Vec<PluginTreeNode> {
        let mut visited = HashSet::new();
        self.roots()
            .iter()
            .filter_map(|root| self.tree_node(root, 0, &mut visited))
            .collect()
    }

    fn tree_node(
        &self,
        id: &str,
        level: usize,
        visited: &mut HashSet<String>,
    ) -> Option<PluginTreeNode> {
        if !visited.insert(id.to_string()) {
            return None;
        }
        let record = self.records.get(id)?;
        let children = self
            .get_children(id)
            .iter()
            .filter_map(|c| self.tree_node(c, level + 1, visited))
            .collect();
        Some(PluginTreeNode {
            id: record.id.clone(),
            kind: record.kind.clone(),
            level,
            children,
        })
    }

    /// Report dangling parents, cycles and entries deeper than `max_depth`.
    pub fn validate_integrity(&self) -> Vec<IntegrityIssue> {
        let mut issues = Vec::new();
        for id in &self.order {
            let Some(record) = self.records.get(id) else {
                continue;
            };
            if let Some(parent) = &record.parent_id {
                if !self.records.contains_key(parent) {
                    issues.push(IntegrityIssue::MissingParent {
                        id: id.clone(),
                        parent_id: parent.clone(),
                    });
                    continue;
                }
            }
            if self.in_cycle(id) {
                issues.push(IntegrityIssue::CircularReference { id: id.clone() });
                continue;
            }
            let level = self.get_level(id);
            if level > self.limits.max_depth {
                issues.push(IntegrityIssue::DepthViolation {
                    id: id.clone(),
                    level,
                    max: self.limits.max_depth,
                });
            }
        }
        issues
    }

    fn in_cycle(&self, id: &str) -> bool {
        let mut visited = HashSet::new();
        let mut current = self.records.get(id).and_then(|r| r.parent_id.clone());
        while let Some(node) = current {
            if node == id {
                return true;
            }
            if !visited.insert(node.clone()) || visited.len() > self.limits.max_traversal_depth {
                return false;
            }
            current = self.records.get(&node).and_then(|r| r.parent_id.clone());
        }
        false
    }

    pub fn resource_usage(&self) -> ResourceUsage {
        self.ledger.snapshot()
    }

    pub fn ledger(&self) -> &ResourceLedger {
        &self.ledger
    }

    /// Take every record out, in registration order, releasing their charges.
    pub fn drain(&mut self) -> Vec<PluginRecord> {
        let order = std::mem::take(&mut self.order);
        let mut out = Vec::with_capacity(order.len());
        for id in order {
            if let Some(record) = self.records.remove(&id) {
                out.push(record);
            }
        }
        self.records.clear();
        self.children.clear();
        self.by_type.clear();
        self.ledger.clear();
        out
    }

    /// Check that records drained from another registry fit here: no id is
    /// taken, no level passes `max_depth` and no owner passes the ceiling.
    pub fn check_adopt(
        &self,
        incoming: &[PluginRecord],
        previous_root_owner: &str,
    ) -> Result<(), PluginError> {
        let parents: HashMap<&str, Option<&str>> = incoming
            .iter()
            .map(|r| (r.id.as_str(), r.parent_id.as_deref()))
            .collect();
        let mut charges: BTreeMap<String, u64> = BTreeMap::new();

        for record in incoming {
            if self.records.contains_key(&record.id) {
                return Err(PluginError::DuplicateId(record.id.clone()));
            }
            let level = self.incoming_level(&parents, &record.id);
            if level > self.limits.max_depth {
                return Err(PluginError::MaxDepthExceeded {
                    level,
                    max: self.limits.max_depth,
                });
            }
            if let Some(owner) = &record.resource_owner {
                let total = charges
                    .entry(self.adopted_owner(owner, previous_root_owner))
                    .or_insert(0);
                *total = total.saturating_add(record.resource_cost);
            }
        }

        for (owner, cost) in charges {
            if !self.ledger.can_afford(&owner, cost) {
                return Err(PluginError::InsufficientResources {
                    requested: cost,
                    available: self
                        .ledger
                        .ceiling()
                        .saturating_sub(self.ledger.usage(&owner)),
                    owner,
                });
            }
        }
        Ok(())
    }

    /// Level of `id` within a foreign parent map. Bounded like the other walks.
    fn incoming_level(&self, parents: &HashMap<&str, Option<&str>>, id: &str) -> usize {
        let mut visited = HashSet::new();
        let mut level = 0;
        let mut current = parents.get(id).copied().flatten();
        while let Some(node) = current {
            if !visited.insert(node) || level >= self.limits.max_traversal_depth {
                break;
            }
            level += 1;
            current = parents.get(node).copied().flatten();
        }
        level
    }

    fn adopted_owner(&self, owner: &str, previous_root_owner: &str) -> String {
        if owner == previous_root_owner {
            self.root_owner.clone()
        } else {
            owner.to_string()
        }
    }

    /// Accept a record migrated from another registry.
    ///
    /// Parent links are kept; a charge that belonged to the old root owner is
    /// moved to this registry's root owner. An id already present is rejected
    /// and nothing changes.
    pub fn adopt(
        &mut self,
        mut record: PluginRecord,
        previous_root_owner: &str,
    ) -> Result<(), PluginError> {
        if self.records.contains_key(&record.id) {
            return Err(PluginError::DuplicateId(record.id));
        }
        if let Some(owner) = record.resource_owner.take() {
            let owner = self.adopted_owner(&owner, previous_root_owner);
            if !self.ledger.can_afford(&owner, record.resource_cost) {
                warn!(
                    plugin = %record.id,
                    owner = %owner,
                    cost = record.resource_cost,
                    "Adopted plugin takes its owner past the resource ceiling"
                );
            }
            self.ledger.charge(&owner, record.resource_cost);
            record.resource_owner = Some(owner);
        }
        self.insert(record);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.drain();
    }
}
