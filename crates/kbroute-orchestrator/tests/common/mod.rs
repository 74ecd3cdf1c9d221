#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use kbroute_core::error::AdapterFailure;
use kbroute_core::traits::{CollectionSource, IndexAdapter, ListedCollection};
use kbroute_core::types::{Chunk, Collection, CollectionRef, Hit, PreparedQuery, SourceGroup};

/// Adapter that answers from a script: an optional delay, then a fixed outcome
/// per call (the last entry repeats).
pub struct Scripted {
    name: String,
    delay: Duration,
    outcomes: Vec<Result<Vec<Hit>, AdapterFailure>>,
    needs_embedding: bool,
    panics: bool,
    pub calls: AtomicUsize,
}

impl Scripted {
    pub fn hits(name: &str, hits: Vec<Hit>) -> Self {
        Self::with_outcomes(name, vec![Ok(hits)])
    }

    pub fn failing(name: &str, failure: AdapterFailure) -> Self {
        Self::with_outcomes(name, vec![Err(failure)])
    }

    pub fn with_outcomes(name: &str, outcomes: Vec<Result<Vec<Hit>, AdapterFailure>>) -> Self {
        Self { name: name.to_string(), delay: Duration::ZERO, outcomes, needs_embedding: false, panics: false, calls: AtomicUsize::new(0) }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn vector(mut self) -> Self {
        self.needs_embedding = true;
        self
    }

    pub fn panicking(mut self) -> Self {
        self.panics = true;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IndexAdapter for Scripted {
    fn name(&self) -> &str {
        &self.name
    }

    fn needs_embedding(&self) -> bool {
        self.needs_embedding
    }

    async fn query(&self, _query: &PreparedQuery, _top_k: usize, _deadline: Instant) -> Result<Vec<Hit>, AdapterFailure> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.panics {
            panic!("index segment is corrupt");
        }
        self.outcomes[n.min(self.outcomes.len() - 1)].clone()
    }
}

pub fn hit(chunk_id: &str, score: f32, collection: &str, weight: f32) -> Hit {
    Hit { chunk: Chunk::new(chunk_id, format!("text of {chunk_id}")), score, collection: CollectionRef::new(collection, weight) }
}

/// Collection source with a mutable listing and per-collection adapters.
pub struct ScriptedSource {
    label: String,
    group: SourceGroup,
    listing: Mutex<Result<Vec<ListedCollection>, String>>,
    adapters: Mutex<HashMap<String, Arc<dyn IndexAdapter>>>,
}

impl ScriptedSource {
    pub fn new(label: &str, group: SourceGroup) -> Self {
        Self {
            label: label.to_string(),
            group,
            listing: Mutex::new(Ok(Vec::new())),
            adapters: Mutex::new(HashMap::new()),
        }
    }

    pub fn serve(self, collection: &str, adapter: Arc<dyn IndexAdapter>) -> Self {
        self.serve_listed(ListedCollection { name: collection.to_string(), dimension: None }, adapter)
    }

    pub fn serve_with_dimension(self, collection: &str, dimension: usize, adapter: Arc<dyn IndexAdapter>) -> Self {
        self.serve_listed(ListedCollection { name: collection.to_string(), dimension: Some(dimension) }, adapter)
    }

    fn serve_listed(self, listed: ListedCollection, adapter: Arc<dyn IndexAdapter>) -> Self {
        let collection = listed.name.clone();
        self.listing.lock().unwrap().as_mut().unwrap().push(listed);
        self.adapters.lock().unwrap().insert(collection.to_string(), adapter);
        self
    }

    pub fn set_listing(&self, listing: Result<Vec<&str>, &str>) {
        *self.listing.lock().unwrap() = listing
            .map(|names| names.into_iter().map(|n| ListedCollection { name: n.to_string(), dimension: None }).collect())
            .map_err(str::to_string);
    }
}

#[async_trait]
impl CollectionSource for ScriptedSource {
    fn label(&self) -> &str {
        &self.label
    }

    fn group(&self) -> SourceGroup {
        self.group
    }

    async fn list_collections(&self) -> anyhow::Result<Vec<ListedCollection>> {
        self.listing.lock().unwrap().clone().map_err(|e| anyhow::anyhow!(e))
    }

    fn adapter(&self, collection: &Collection) -> Arc<dyn IndexAdapter> {
        self.adapters
            .lock()
            .unwrap()
            .get(&collection.name)
            .cloned()
            .unwrap_or_else(|| Arc::new(Scripted::hits(&collection.id(), Vec::new())))
    }
}

/// Event delivery runs in the background; wait until `path` holds `lines` lines.
pub async fn wait_for_lines(path: &std::path::Path, lines: usize) -> String {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(text) = tokio::fs::read_to_string(path).await {
                if text.lines().count() >= lines {
                    return text;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    waited.unwrap_or_else(|_| panic!("{} never reached {lines} lines", path.display()))
}
