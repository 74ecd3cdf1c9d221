//! Concurrent fan-out of one query to many adapters under a deadline.

use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;

use kbroute_core::error::{AdapterFailure, FailureKind};
use kbroute_core::traits::IndexAdapter;
use kbroute_core::types::{HealthMark, Hit, PreparedQuery};

/// One adapter call of a tier, with the health mark it reports into and the
/// vector size its collection expects, when known.
#[derive(Clone)]
pub struct Target {
    pub adapter: Arc<dyn IndexAdapter>,
    pub health: Option<HealthMark>,
    pub dimension: Option<usize>,
}

impl Target {
    pub fn new(adapter: Arc<dyn IndexAdapter>) -> Self {
        Self { adapter, health: None, dimension: None }
    }

    pub fn with_health(mut self, health: HealthMark) -> Self {
        self.health = Some(health);
        self
    }

    pub fn with_dimension(mut self, dimension: Option<usize>) -> Self {
        self.dimension = dimension;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AdapterError {
    pub adapter: String,
    pub kind: FailureKind,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct FanoutResult {
    /// Union of hits from every adapter that answered before the deadline.
    pub hits: Vec<Hit>,
    /// True if any adapter failed or was discarded at the deadline.
    pub partial: bool,
    pub failures: Vec<AdapterError>,
    /// Adapters still outstanding at the deadline.
    pub discarded: Vec<String>,
}

pub struct FanoutCoordinator {
    permits: Arc<Semaphore>,
    tier_max_latency: Duration,
    top_k: usize,
}

impl FanoutCoordinator {
    pub fn new(max_concurrent_calls: usize, tier_max_latency: Duration, top_k: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent_calls.max(1))),
            tier_max_latency,
            top_k: top_k.max(1),
        }
    }

    /// Query every target concurrently and collect what arrives in time.
    ///
    /// The tier deadline is the earlier of the request deadline and
    /// `now + tier_max_latency`. Calls still running at that point are aborted.
    pub async fn search(&self, targets: Vec<Target>, query: Arc<PreparedQuery>) -> FanoutResult {
        if targets.is_empty() {
            return FanoutResult::default();
        }
        let deadline = query.deadline.min(Instant::now() + self.tier_max_latency);
        let names: Vec<String> = targets.iter().map(|t| t.adapter.name().to_string()).collect();
        let mut done = vec![false; targets.len()];

        let mut set = JoinSet::new();
        for (idx, target) in targets.into_iter().enumerate() {
            let permits = self.permits.clone();
            let query = query.clone();
            let top_k = self.top_k;
            set.spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                let outcome = AssertUnwindSafe(call_adapter(&target, &query, top_k, deadline))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| Err(AdapterFailure::bad_response(format!("adapter panicked: {}", panic_message(&*panic)))));
                (idx, outcome)
            });
        }

        let mut result = FanoutResult::default();
        loop {
            match tokio::time::timeout_at(deadline, set.join_next()).await {
                Ok(Some(Ok((idx, outcome)))) => {
                    done[idx] = true;
                    match outcome {
                        Ok(hits) => result.hits.extend(hits),
                        Err(failure) => {
                            tracing::warn!(adapter = %names[idx], kind = ?failure.kind, error = %failure.message, "adapter failed");
                            result.failures.push(AdapterError {
                                adapter: names[idx].clone(),
                                kind: failure.kind,
                                message: failure.message,
                            });
                        }
                    }
                }
                Ok(Some(Err(e))) => tracing::warn!(error = %e, "adapter task aborted"),
                Ok(None) => break,
                Err(_) => {
                    set.abort_all();
                    break;
                }
            }
        }

        result.discarded = names
            .into_iter()
            .zip(done)
            .filter(|(_, finished)| !finished)
            .map(|(name, _)| name)
            .collect();
        if !result.discarded.is_empty() {
            tracing::warn!(discarded = ?result.discarded, "adapters discarded at deadline");
        }
        result.partial = !result.failures.is_empty() || !result.discarded.is_empty();
        result
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

/// One adapter call with at most one retry, only for `Unreachable` and only
/// while the deadline has not passed. Health is recorded on the final outcome.
async fn call_adapter(target: &Target, query: &PreparedQuery, top_k: usize, deadline: Instant) -> Result<Vec<Hit>, AdapterFailure> {
    let adapter = &target.adapter;
    let started = Instant::now();
    let mut outcome = adapter.query(query, top_k, deadline).await;
    if matches!(&outcome, Err(f) if f.is_retryable()) && Instant::now() < deadline {
        tracing::debug!(adapter = adapter.name(), "retrying unreachable adapter");
        outcome = adapter.query(query, top_k, deadline).await;
    }
    if let Some(health) = &target.health {
        match &outcome {
            Ok(_) => health.mark_seen(),
            Err(f) if f.kind == FailureKind::Unreachable => health.mark_unhealthy(),
            Err(_) => {}
        }
    }
    tracing::debug!(
        adapter = adapter.name(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        hits = outcome.as_ref().map(Vec::len).unwrap_or(0),
        ok = outcome.is_ok(),
        "adapter call finished"
    );
    outcome
}
