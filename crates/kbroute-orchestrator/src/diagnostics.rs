//! Health reporting. Observes outcomes; never feeds back into ranking or fallback.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use kbroute_core::types::{CollectionStatus, TierLabel};

use crate::registry::CollectionRegistry;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub collections_discovered: usize,
    pub healthy: usize,
    /// Answering tier per served query, keyed by tier label.
    pub last_tier_used_histogram: BTreeMap<String, u64>,
    pub queries: u64,
    pub not_found: u64,
    pub partial_results: u64,
    pub last_discovery: Option<DateTime<Utc>>,
    pub collections: Vec<CollectionStatus>,
}

#[derive(Debug, Default)]
struct Counters {
    tiers: BTreeMap<TierLabel, u64>,
    queries: u64,
    not_found: u64,
    partial_results: u64,
}

pub struct HealthReporter {
    registry: Arc<CollectionRegistry>,
    counters: Mutex<Counters>,
}

impl HealthReporter {
    pub fn new(registry: Arc<CollectionRegistry>) -> Self {
        Self { registry, counters: Mutex::new(Counters::default()) }
    }

    /// Record one served query. `tier` is `None` for not-found outcomes.
    pub fn record(&self, tier: Option<TierLabel>, partial: bool) {
        let mut c = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        c.queries += 1;
        match tier {
            Some(t) => *c.tiers.entry(t).or_default() += 1,
            None => c.not_found += 1,
        }
        if partial {
            c.partial_results += 1;
        }
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let registry = self.registry.current();
        let collections: Vec<CollectionStatus> = registry.entries().iter().map(|e| e.collection.status()).collect();
        let c = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        HealthSnapshot {
            collections_discovered: collections.len(),
            healthy: collections.iter().filter(|s| s.healthy).count(),
            last_tier_used_histogram: c.tiers.iter().map(|(t, n)| (t.as_str().to_string(), *n)).collect(),
            queries: c.queries,
            not_found: c.not_found,
            partial_results: c.partial_results,
            last_discovery: registry.discovered_at(),
            collections,
        }
    }
}
