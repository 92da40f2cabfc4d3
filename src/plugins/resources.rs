//! Resource ledger: accumulated plugin cost per owning identity.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

/// Per-owner cost accounting bounded by a ceiling.
#[derive(Debug, Clone)]
pub struct ResourceLedger {
    ceiling: u64,
    usage: HashMap<String, u64>,
}

/// Ledger snapshot for stats.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    pub ceiling: u64,
    pub by_owner: BTreeMap<String, u64>,
    pub total: u64,
}

impl ResourceLedger {
    pub fn new(ceiling: u64) -> Self {
        Self {
            ceiling,
            usage: HashMap::new(),
        }
    }

    pub fn ceiling(&self) -> u64 {
        self.ceiling
    }

    pub fn usage(&self, owner: &str) -> u64 {
        self.usage.get(owner).copied().unwrap_or(0)
    }

    /// Whether `owner` can take on `cost` more without passing the ceiling.
    pub fn can_afford(&self, owner: &str, cost: u64) -> bool {
        self.usage(owner)
            .checked_add(cost)
            .map(|total| total <= self.ceiling)
            .unwrap_or(false)
    }

    /// Record `cost` against `owner`. Callers check [`can_afford`](Self::can_afford) first.
    pub fn charge(&mut self, owner: &str, cost: u64) {
        if cost == 0 {
            return;
        }
        let entry = self.usage.entry(owner.to_string()).or_insert(0);
        *entry = entry.saturating_add(cost);
    }

    /// Give `cost` back to `owner`. Never goes below zero.
    pub fn release(&mut self, owner: &str, cost: u64) {
        if cost == 0 {
            return;
        }
        if let Some(used) = self.usage.get_mut(owner) {
            *used = used.saturating_sub(cost);
            if *used == 0 {
                self.usage.remove(owner);
            }
        }
    }

    pub fn snapshot(&self) -> ResourceUsage {
        let by_owner: BTreeMap<String, u64> =
            self.usage.iter().map(|(k, v)| (k.clone(), *v)).collect();
        let total = by_owner.values().sum();
        ResourceUsage {
            ceiling: self.ceiling,
            by_owner,
            total,
        }
    }

    pub fn clear(&mut self) {
        self.usage.clear();
    }
}
