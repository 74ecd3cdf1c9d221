//! Collection registry.
//!
//! Holds the discovered collections as an immutable snapshot behind
//! `RwLock<Arc<_>>`. Discovery builds a complete new snapshot and swaps it in;
//! readers clone the `Arc` and never observe a half-updated set.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};

use kbroute_core::traits::{CollectionSource, IndexAdapter, ListedCollection};
use kbroute_core::types::{Collection, SourceGroup};

/// A registered collection and the adapter that queries it.
#[derive(Clone)]
pub struct RegistryEntry {
    pub collection: Collection,
    pub adapter: Arc<dyn IndexAdapter>,
}

/// Immutable view of the registry at one point in time.
///
/// Entries are ordered by weight descending, then collection id ascending.
#[derive(Clone, Default)]
pub struct RegistrySnapshot {
    entries: Vec<RegistryEntry>,
    discovered_at: Option<DateTime<Utc>>,
}

impl RegistrySnapshot {
    fn new(mut entries: Vec<RegistryEntry>, discovered_at: DateTime<Utc>) -> Self {
        entries.sort_by(|a, b| {
            b.collection
                .weight()
                .total_cmp(&a.collection.weight())
                .then_with(|| a.collection.id().cmp(&b.collection.id()))
        });
        Self { entries, discovered_at: Some(discovered_at) }
    }

    pub fn entries(&self) -> &[RegistryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn discovered_at(&self) -> Option<DateTime<Utc>> {
        self.discovered_at
    }

    /// Collections in registry order, optionally restricted to one group.
    pub fn list(&self, group: Option<SourceGroup>) -> Vec<Collection> {
        self.entries
            .iter()
            .filter(|e| group.map_or(true, |g| e.collection.group == g))
            .map(|e| e.collection.clone())
            .collect()
    }
}

/// Outcome of one discovery pass.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct DiscoveryReport {
    pub backends_ok: usize,
    /// `(backend, reason)` for each backend whose listing failed.
    pub backends_failed: Vec<(String, String)>,
    pub collections: usize,
}

pub struct CollectionRegistry {
    sources: Vec<Arc<dyn CollectionSource>>,
    state: RwLock<Arc<RegistrySnapshot>>,
}

impl CollectionRegistry {
    pub fn new(sources: Vec<Arc<dyn CollectionSource>>) -> Self {
        Self { sources, state: RwLock::new(Arc::new(RegistrySnapshot::default())) }
    }

    /// The snapshot queries currently run against.
    pub fn current(&self) -> Arc<RegistrySnapshot> {
        self.state.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn list(&self, group: Option<SourceGroup>) -> Vec<Collection> {
        self.current().list(group)
    }

    pub fn last_discovery(&self) -> Option<DateTime<Utc>> {
        self.current().discovered_at()
    }

    /// List every backend concurrently and replace the registry snapshot.
    ///
    /// Collections of a backend that fails to list are carried over from the
    /// previous snapshot and marked unhealthy. Collections a reachable backend
    /// no longer lists are dropped. Health history survives rediscovery.
    pub async fn discover(&self) -> DiscoveryReport {
        let prior = self.current();
        let mut set = JoinSet::new();
        for (idx, source) in self.sources.iter().enumerate() {
            let source = source.clone();
            set.spawn(async move { (idx, source.list_collections().await) });
        }
        let mut listings: Vec<Option<anyhow::Result<Vec<ListedCollection>>>> =
            (0..self.sources.len()).map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((idx, listing)) => listings[idx] = Some(listing),
                Err(e) => tracing::warn!(error = %e, "discovery task failed"),
            }
        }

        let known: HashMap<String, &RegistryEntry> =
            prior.entries().iter().map(|e| (e.collection.id(), e)).collect();
        let mut report = DiscoveryReport::default();
        let mut entries = Vec::new();
        for (source, listing) in self.sources.iter().zip(listings) {
            let listing = listing.unwrap_or_else(|| Err(anyhow::anyhow!("discovery task did not complete")));
            match listing {
                Ok(listed) => {
                    report.backends_ok += 1;
                    for item in listed {
                        let mut collection = Collection::new(source.label(), item.name, source.group());
                        collection.dimension = item.dimension;
                        if let Some(previous) = known.get(&collection.id()) {
                            collection.health = previous.collection.health.clone();
                            collection.health.mark_seen();
                        }
                        let adapter = source.adapter(&collection);
                        entries.push(RegistryEntry { collection, adapter });
                    }
                }
                Err(e) => {
                    tracing::warn!(backend = source.label(), error = %e, "backend discovery failed, keeping stale collections");
                    report.backends_failed.push((source.label().to_string(), e.to_string()));
                    for entry in prior.entries().iter().filter(|e| e.collection.backend == source.label()) {
                        entry.collection.health.mark_unhealthy();
                        entries.push(entry.clone());
                    }
                }
            }
        }
        report.collections = entries.len();
        let snapshot = RegistrySnapshot::new(entries, Utc::now());
        *self.state.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(snapshot);
        tracing::info!(
            collections = report.collections,
            backends_ok = report.backends_ok,
            backends_failed = report.backends_failed.len(),
            "registry discovery finished"
        );
        report
    }

    /// Re-run discovery every `interval`. The first pass happens one interval
    /// from now; call `discover` directly for an immediate one.
    pub fn spawn_refresh(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                registry.discover().await;
            }
        })
    }
}
