//! Tiered fallback chain.
//!
//! Each tier is a `TierStrategy`. Tiers run in order until one yields a
//! non-empty ranked list; that tier ends the chain even when its result is
//! partial. All tiers empty is a normal `Exhausted` outcome.

use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::time::Instant;

use kbroute_core::traits::IndexAdapter;
use kbroute_core::types::{HealthMark, PreparedQuery, RankedResult, TierLabel};

use crate::fanout::{AdapterError, FanoutCoordinator, FanoutResult, Target};
use crate::rank::rank;
use crate::registry::CollectionRegistry;

pub trait TierStrategy: Send + Sync {
    fn label(&self) -> TierLabel;

    /// Adapter calls this tier makes for one query.
    fn targets(&self) -> Vec<Target>;

    /// Whether any of this tier's adapters needs the query embedding.
    fn needs_embedding(&self) -> bool {
        self.targets().iter().any(|t| t.adapter.needs_embedding())
    }
}

/// Targets of one tier split by whether they can serve the prepared query.
struct Selection {
    runnable: Vec<Target>,
    /// Vector targets left out because there is no query embedding.
    unembedded: usize,
    /// Vector targets whose collection dimension differs from the embedding.
    incompatible: Vec<String>,
}

fn select_targets(targets: Vec<Target>, query: &PreparedQuery) -> Selection {
    let mut selection = Selection { runnable: Vec::new(), unembedded: 0, incompatible: Vec::new() };
    for target in targets {
        if !target.adapter.needs_embedding() {
            selection.runnable.push(target);
            continue;
        }
        match (&query.embedding, target.dimension) {
            (None, _) => selection.unembedded += 1,
            (Some(embedding), Some(dim)) if dim != embedding.len() => {
                tracing::warn!(adapter = target.adapter.name(), dim, query_dim = embedding.len(), "collection dimension differs from query embedding, skipping");
                selection.incompatible.push(target.adapter.name().to_string());
            }
            _ => selection.runnable.push(target),
        }
    }
    selection
}

/// First tier: every collection currently in the registry.
pub struct RegistryTier {
    registry: Arc<CollectionRegistry>,
}

impl RegistryTier {
    pub fn new(registry: Arc<CollectionRegistry>) -> Self {
        Self { registry }
    }
}

impl TierStrategy for RegistryTier {
    fn label(&self) -> TierLabel {
        TierLabel::MultiCollection
    }

    fn targets(&self) -> Vec<Target> {
        self.registry
            .current()
            .entries()
            .iter()
            .map(|e| {
                Target::new(e.adapter.clone())
                    .with_health(e.collection.health.clone())
                    .with_dimension(e.collection.dimension)
            })
            .collect()
    }
}

/// A tier backed by one fixed adapter (single index, snapshot, keyword files).
pub struct FixedTier {
    label: TierLabel,
    target: Target,
}

impl FixedTier {
    pub fn new(label: TierLabel, adapter: Arc<dyn IndexAdapter>) -> Self {
        Self { label, target: Target::new(adapter) }
    }

    pub fn with_health(mut self, health: HealthMark) -> Self {
        self.target.health = Some(health);
        self
    }
}

impl TierStrategy for FixedTier {
    fn label(&self) -> TierLabel {
        self.label
    }

    fn targets(&self) -> Vec<Target> {
        vec![self.target.clone()]
    }
}

/// What happened in one tier of one request.
#[derive(Debug, Clone, Serialize)]
pub struct TierAttempt {
    pub tier: TierLabel,
    pub targets: usize,
    pub hits: usize,
    pub results: usize,
    pub partial: bool,
    pub failures: Vec<AdapterError>,
    pub discarded: Vec<String>,
    /// Adapters left out because their vector size does not match the query.
    pub incompatible: Vec<String>,
    /// Set when the tier was not run, e.g. for lack of a query embedding.
    pub skipped: Option<String>,
    pub latency_ms: u64,
}

#[derive(Debug, Clone)]
pub enum ChainOutcome {
    Found { tier: TierLabel, results: Vec<RankedResult>, partial: bool, attempts: Vec<TierAttempt> },
    Exhausted { attempts: Vec<TierAttempt> },
}

pub struct FallbackChain {
    tiers: Vec<Arc<dyn TierStrategy>>,
    default_order: Vec<TierLabel>,
    fanout: FanoutCoordinator,
}

impl FallbackChain {
    /// `default_order` is filtered to the configured tiers; tiers missing
    /// from it are never run unless a request names them.
    pub fn new(tiers: Vec<Arc<dyn TierStrategy>>, default_order: &[TierLabel], fanout: FanoutCoordinator) -> Self {
        let mut chain = Self { tiers, default_order: Vec::new(), fanout };
        chain.default_order = chain.resolve(default_order);
        chain
    }

    pub fn configured(&self) -> Vec<TierLabel> {
        self.tiers.iter().map(|t| t.label()).collect()
    }

    pub fn default_order(&self) -> &[TierLabel] {
        &self.default_order
    }

    fn tier(&self, label: TierLabel) -> Option<&Arc<dyn TierStrategy>> {
        self.tiers.iter().find(|t| t.label() == label)
    }

    fn resolve(&self, labels: &[TierLabel]) -> Vec<TierLabel> {
        let mut seen = HashSet::new();
        let mut order = Vec::new();
        for &label in labels {
            if self.tier(label).is_none() {
                tracing::warn!(tier = %label, "tier is not configured, ignoring");
                continue;
            }
            if seen.insert(label) {
                order.push(label);
            }
        }
        order
    }

    /// Tier order for one request. An override naming no configured tier
    /// falls back to the default order.
    pub fn effective_order(&self, requested: Option<&[TierLabel]>) -> Vec<TierLabel> {
        match requested {
            Some(labels) => {
                let order = self.resolve(labels);
                if order.is_empty() {
                    tracing::warn!("tier override names no configured tier, using default order");
                    self.default_order.clone()
                } else {
                    order
                }
            }
            None => self.default_order.clone(),
        }
    }

    pub fn order_needs_embedding(&self, order: &[TierLabel]) -> bool {
        order.iter().filter_map(|l| self.tier(*l)).any(|t| t.needs_embedding())
    }

    /// Run tiers in `order` until one yields results.
    pub async fn run(&self, query: Arc<PreparedQuery>, order: &[TierLabel], top_n: usize) -> ChainOutcome {
        let mut attempts = Vec::with_capacity(order.len());
        for &label in order {
            let Some(tier) = self.tier(label) else { continue };
            let started = Instant::now();
            let targets = tier.targets();
            let all_targets = targets.len();
            let selection = select_targets(targets, &query);

            if all_targets > 0 && selection.unembedded == all_targets {
                tracing::info!(tier = %label, "skipping tier without query embedding");
                attempts.push(TierAttempt {
                    tier: label,
                    targets: all_targets,
                    hits: 0,
                    results: 0,
                    partial: false,
                    failures: Vec::new(),
                    discarded: Vec::new(),
                    incompatible: Vec::new(),
                    skipped: Some("query embedding unavailable".to_string()),
                    latency_ms: 0,
                });
                continue;
            }

            let fanned: FanoutResult = self.fanout.search(selection.runnable, query.clone()).await;
            let hit_count = fanned.hits.len();
            let results = rank(fanned.hits, top_n, label);
            let attempt = TierAttempt {
                tier: label,
                targets: all_targets,
                hits: hit_count,
                results: results.len(),
                partial: fanned.partial,
                failures: fanned.failures,
                discarded: fanned.discarded,
                incompatible: selection.incompatible,
                skipped: None,
                latency_ms: started.elapsed().as_millis() as u64,
            };
            let partial = attempt.partial;
            attempts.push(attempt);

            if results.is_empty() {
                tracing::info!(tier = %label, partial, "tier empty, falling back");
                continue;
            }
            tracing::info!(tier = %label, results = results.len(), partial, "tier answered");
            return ChainOutcome::Found { tier: label, results, partial, attempts };
        }
        tracing::info!(tiers = attempts.len(), "all tiers exhausted");
        ChainOutcome::Exhausted { attempts }
    }
}
