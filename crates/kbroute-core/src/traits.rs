use async_trait::async_trait;
use std::sync::Arc;
use tokio::time::Instant;

use crate::error::AdapterFailure;
use crate::types::{Collection, Hit, PreparedQuery};

/// Turns query text into the vector space of the indexed collections.
pub trait Embedder: Send + Sync {
    /// Stable identifier for the model (e.g. `minilm:d384`).
    fn id(&self) -> &str;
    fn dim(&self) -> usize;
    fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>>;
}

/// Uniform interface to one similarity-search backend instance.
///
/// Implementations must not retry. Returning `Ok(vec![])` means the backend
/// answered with no matches.
#[async_trait]
pub trait IndexAdapter: Send + Sync {
    /// Human readable name used in logs.
    fn name(&self) -> &str;

    /// Whether `query.embedding` must be present for this backend.
    fn needs_embedding(&self) -> bool {
        true
    }

    async fn query(
        &self,
        query: &PreparedQuery,
        top_k: usize,
        deadline: Instant,
    ) -> Result<Vec<Hit>, AdapterFailure>;
}

/// Collection listing of one backend, used by the registry.
#[derive(Debug, Clone)]
pub struct ListedCollection {
    pub name: String,
    pub dimension: Option<usize>,
}

/// A backend hosting collections ("folders") of one source group.
#[async_trait]
pub trait CollectionSource: Send + Sync {
    /// Backend label; becomes the prefix of each collection id.
    fn label(&self) -> &str;

    fn group(&self) -> crate::types::SourceGroup;

    /// List every collection currently hosted by the backend.
    async fn list_collections(&self) -> anyhow::Result<Vec<ListedCollection>>;

    /// Build the adapter that queries `collection` on this backend.
    fn adapter(&self, collection: &Collection) -> Arc<dyn IndexAdapter>;
}
