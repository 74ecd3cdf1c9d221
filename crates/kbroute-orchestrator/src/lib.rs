//! kbroute-orchestrator
//!
//! Answers a text query from many weighted knowledge collections. A query
//! runs through the fallback chain (registry collections, single index, local
//! snapshot, keyword files); each tier fans out to its adapters under the
//! request deadline and merges their hits into one ranked list.
#![deny(warnings)]
#![deny(dead_code, unused_variables, unused_imports)]

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::time::Instant;

use kbroute_core::config::RetrievalSettings;
use kbroute_core::traits::Embedder;
use kbroute_core::types::{PreparedQuery, QueryRequest, RankedResult, TierLabel};

pub mod bootstrap;
pub mod chain;
pub mod diagnostics;
pub mod events;
pub mod fanout;
pub mod rank;
pub mod registry;

pub use chain::{ChainOutcome, FallbackChain, FixedTier, RegistryTier, TierAttempt, TierStrategy};
pub use diagnostics::{HealthReporter, HealthSnapshot};
pub use events::{EventDispatcher, EventSink, JsonlSink, QueryEvent, TracingSink};
pub use fanout::{FanoutCoordinator, FanoutResult, Target};
pub use registry::{CollectionRegistry, DiscoveryReport, RegistrySnapshot};

/// Results of the tier that answered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalReport {
    pub tier: TierLabel,
    pub results: Vec<RankedResult>,
    pub partial: bool,
    pub latency_ms: u64,
    #[serde(skip_deserializing)]
    pub attempts: Vec<TierAttempt>,
}

/// Every tier came back empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotFound {
    pub tiers_attempted: Vec<TierLabel>,
    pub latency_ms: u64,
    #[serde(skip_deserializing)]
    pub attempts: Vec<TierAttempt>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Retrieval {
    Found(RetrievalReport),
    NotFound(NotFound),
}

impl Retrieval {
    pub fn results(&self) -> &[RankedResult] {
        match self {
            Retrieval::Found(r) => &r.results,
            Retrieval::NotFound(_) => &[],
        }
    }

    pub fn tier(&self) -> Option<TierLabel> {
        match self {
            Retrieval::Found(r) => Some(r.tier),
            Retrieval::NotFound(_) => None,
        }
    }

    pub fn partial(&self) -> bool {
        matches!(self, Retrieval::Found(r) if r.partial)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Retrieval::NotFound(_))
    }
}

pub struct KnowledgeOrchestrator {
    registry: Arc<CollectionRegistry>,
    chain: FallbackChain,
    embedder: Option<Arc<dyn Embedder>>,
    reporter: HealthReporter,
    events: EventDispatcher,
    settings: RetrievalSettings,
}

impl KnowledgeOrchestrator {
    pub fn builder(registry: Arc<CollectionRegistry>) -> OrchestratorBuilder {
        OrchestratorBuilder {
            registry,
            tiers: Vec::new(),
            embedder: None,
            sinks: vec![Arc::new(TracingSink)],
            settings: RetrievalSettings::default(),
        }
    }

    pub fn registry(&self) -> &Arc<CollectionRegistry> {
        &self.registry
    }

    pub fn chain(&self) -> &FallbackChain {
        &self.chain
    }

    pub fn health(&self) -> HealthSnapshot {
        self.reporter.snapshot()
    }

    /// Answer one query. Adapter failures never surface here; they show up as
    /// `partial` results or as fallback to later tiers.
    pub async fn retrieve(&self, request: QueryRequest) -> Retrieval {
        let started = Instant::now();
        let budget = request.deadline.unwrap_or_else(|| self.settings.default_deadline());
        let deadline = started + budget;
        let top_n = request.top_n.filter(|n| *n > 0).unwrap_or(self.settings.top_n);
        let order = self.chain.effective_order(request.tier_order.as_deref());

        let outcome = if request.text.trim().is_empty() {
            tracing::info!("empty query text");
            ChainOutcome::Exhausted { attempts: Vec::new() }
        } else {
            let mut prepared = PreparedQuery::new(request.text.clone(), deadline).with_filter(request.filter.clone());
            if self.chain.order_needs_embedding(&order) {
                if let Some(embedding) = self.embed_query(&request.text, deadline).await {
                    prepared = prepared.with_embedding(embedding);
                }
            }
            self.chain.run(Arc::new(prepared), &order, top_n).await
        };

        let latency_ms = started.elapsed().as_millis() as u64;
        let retrieval = match outcome {
            ChainOutcome::Found { tier, results, partial, attempts } => {
                Retrieval::Found(RetrievalReport { tier, results, partial, latency_ms, attempts })
            }
            ChainOutcome::Exhausted { attempts } => Retrieval::NotFound(NotFound {
                tiers_attempted: attempts.iter().map(|a| a.tier).collect(),
                latency_ms,
                attempts,
            }),
        };
        self.reporter.record(retrieval.tier(), retrieval.partial());
        self.events.dispatch(QueryEvent {
            query: request.text,
            tier: retrieval.tier(),
            result_count: retrieval.results().len(),
            latency_ms,
            partial: retrieval.partial(),
            timestamp: Utc::now(),
        });
        retrieval
    }

    async fn embed_query(&self, text: &str, deadline: Instant) -> Option<Vec<f32>> {
        let embedder = self.embedder.clone()?;
        let text = text.to_string();
        let task = tokio::task::spawn_blocking(move || embedder.embed(&text));
        match tokio::time::timeout_at(deadline, task).await {
            Ok(Ok(Ok(v))) => Some(v),
            Ok(Ok(Err(e))) => {
                tracing::warn!(error = %e, "query embedding failed, vector tiers skipped");
                None
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "query embedding task failed, vector tiers skipped");
                None
            }
            Err(_) => {
                tracing::warn!("query embedding passed the deadline, vector tiers skipped");
                None
            }
        }
    }
}

pub struct OrchestratorBuilder {
    registry: Arc<CollectionRegistry>,
    tiers: Vec<Arc<dyn TierStrategy>>,
    embedder: Option<Arc<dyn Embedder>>,
    sinks: Vec<Arc<dyn EventSink>>,
    settings: RetrievalSettings,
}

impl OrchestratorBuilder {
    pub fn settings(mut self, settings: RetrievalSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn tier(mut self, tier: Arc<dyn TierStrategy>) -> Self {
        self.tiers.push(tier);
        self
    }

    /// Add the registry-wide multi-collection tier.
    pub fn registry_tier(self) -> Self {
        let tier = Arc::new(RegistryTier::new(self.registry.clone()));
        self.tier(tier)
    }

    pub fn embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Must be called from within a tokio runtime; event delivery runs as a
    /// background task.
    pub fn build(self) -> KnowledgeOrchestrator {
        let fanout = FanoutCoordinator::new(
            self.settings.max_concurrent_calls,
            self.settings.tier_max_latency(),
            self.settings.top_k,
        );
        let chain = FallbackChain::new(self.tiers, &self.settings.tiers, fanout);
        let reporter = HealthReporter::new(self.registry.clone());
        KnowledgeOrchestrator {
            registry: self.registry,
            chain,
            embedder: self.embedder,
            reporter,
            events: EventDispatcher::spawn(self.sinks),
            settings: self.settings,
        }
    }
}
