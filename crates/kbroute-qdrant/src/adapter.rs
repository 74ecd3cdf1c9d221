use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::time::Instant;

use kbroute_core::config::BackendSettings;
use kbroute_core::error::AdapterFailure;
use kbroute_core::traits::{CollectionSource, IndexAdapter, ListedCollection};
use kbroute_core::types::{Chunk, Collection, CollectionRef, Hit, Meta, PreparedQuery, SourceGroup};

use crate::client::{QdrantClient, QdrantResult, ScoredPoint};

const TEXT_KEYS: [&str; 3] = ["text", "content", "page_content"];

/// Queries one collection on one Qdrant instance.
pub struct QdrantAdapter {
    client: Arc<QdrantClient>,
    collection: String,
    source: CollectionRef,
    name: String,
}

impl QdrantAdapter {
    pub fn new(client: Arc<QdrantClient>, collection: impl Into<String>, source: CollectionRef) -> Self {
        let collection = collection.into();
        let name = format!("qdrant:{}", source.id);
        Self { client, collection, source, name }
    }
}

#[async_trait]
impl IndexAdapter for QdrantAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn query(&self, query: &PreparedQuery, top_k: usize, deadline: Instant) -> Result<Vec<Hit>, AdapterFailure> {
        let Some(vector) = query.embedding.as_deref() else {
            return Err(AdapterFailure::bad_response("query has no embedding"));
        };
        let points = self
            .client
            .search(&self.collection, vector, top_k, query.filter.as_ref(), deadline)
            .await?;
        tracing::debug!(adapter = %self.name, hits = points.len(), "qdrant search");
        Ok(points.into_iter().map(|p| point_to_hit(p, &self.source)).collect())
    }
}

fn point_to_hit(point: ScoredPoint, source: &CollectionRef) -> Hit {
    let id = match &point.id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let (text, metadata) = split_payload(point.payload.unwrap_or_default());
    let chunk = Chunk { id, text, vector: None, metadata };
    Hit { chunk, score: point.score, collection: source.clone() }
}

/// Split a point payload into chunk text and flat string metadata.
///
/// Text comes from the first of `text`, `content`, `page_content`. A nested
/// `metadata` object is flattened; top-level keys win on conflicts.
pub fn split_payload(mut payload: serde_json::Map<String, Value>) -> (String, Meta) {
    let mut text = String::new();
    for key in TEXT_KEYS {
        if let Some(Value::String(s)) = payload.get(key) {
            text = s.clone();
            payload.remove(key);
            break;
        }
    }
    let nested = match payload.remove("metadata") {
        Some(Value::Object(map)) => Some(map),
        Some(other) => {
            payload.insert("metadata".to_string(), other);
            None
        }
        None => None,
    };
    let mut meta = Meta::new();
    for (k, v) in payload {
        meta.insert(k, scalar_string(v));
    }
    for (k, v) in nested.into_iter().flatten() {
        meta.entry(k).or_insert_with(|| scalar_string(v));
    }
    (text, meta)
}

fn scalar_string(v: Value) -> String {
    match v {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// A Qdrant instance whose collections form one source group.
pub struct QdrantBackend {
    label: String,
    group: SourceGroup,
    client: Arc<QdrantClient>,
}

impl QdrantBackend {
    pub fn new(settings: &BackendSettings) -> QdrantResult<Self> {
        Ok(Self {
            label: settings.name.clone(),
            group: settings.source_group(),
            client: Arc::new(QdrantClient::new(settings)?),
        })
    }

    /// Adapter for a fixed collection, outside of discovery.
    pub fn adapter_for(&self, collection: &str) -> Arc<dyn IndexAdapter> {
        let source = CollectionRef::new(format!("{}/{}", self.label, collection), self.group.weight());
        Arc::new(QdrantAdapter::new(self.client.clone(), collection, source))
    }
}

#[async_trait]
impl CollectionSource for QdrantBackend {
    fn label(&self) -> &str {
        &self.label
    }

    fn group(&self) -> SourceGroup {
        self.group
    }

    async fn list_collections(&self) -> anyhow::Result<Vec<ListedCollection>> {
        let names = self.client.list_collections().await?;
        let mut listed = Vec::with_capacity(names.len());
        for name in names {
            let dimension = match self.client.collection_dimension(&name).await {
                Ok(d) => d,
                Err(e) => {
                    tracing::warn!(backend = %self.label, collection = %name, error = %e, "could not read collection dimension");
                    None
                }
            };
            listed.push(ListedCollection { name, dimension });
        }
        Ok(listed)
    }

    fn adapter(&self, collection: &Collection) -> Arc<dyn IndexAdapter> {
        Arc::new(QdrantAdapter::new(self.client.clone(), collection.name.clone(), collection.source()))
    }
}
