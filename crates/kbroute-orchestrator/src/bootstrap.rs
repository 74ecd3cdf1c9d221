//! Wire an orchestrator from configuration.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use kbroute_core::config::Config;
use kbroute_core::error::Error;
use kbroute_core::traits::CollectionSource;
use kbroute_core::types::TierLabel;
use kbroute_embed::default_embedder;
use kbroute_qdrant::QdrantBackend;
use kbroute_snapshot::SnapshotIndex;
use kbroute_text::KeywordFileSearch;

use crate::chain::FixedTier;
use crate::events::JsonlSink;
use crate::registry::CollectionRegistry;
use crate::KnowledgeOrchestrator;

/// Build the orchestrator described by `config`. No discovery is run.
///
/// A keyword `docs_dir` that does not exist is a configuration error. A
/// snapshot that cannot be opened, or that was written by another embedder
/// than the query embedder, is logged and left out. An embedder that cannot
/// be loaded is logged and leaves the vector tiers empty.
pub async fn build(config: &Config) -> Result<KnowledgeOrchestrator> {
    let settings = config.settings()?;

    let mut backends = Vec::with_capacity(settings.backends.len());
    for b in &settings.backends {
        let backend = QdrantBackend::new(b)
            .map_err(|e| Error::InvalidConfig(format!("backend '{}': {}", b.name, e)))?;
        backends.push(Arc::new(backend));
    }
    let sources: Vec<Arc<dyn CollectionSource>> =
        backends.iter().map(|b| b.clone() as Arc<dyn CollectionSource>).collect();
    let registry = Arc::new(CollectionRegistry::new(sources));

    let mut builder = KnowledgeOrchestrator::builder(registry)
        .settings(settings.retrieval.clone())
        .registry_tier();

    if let Some(single) = &settings.single_index {
        let backend = backends
            .iter()
            .find(|b| b.label() == single.backend)
            .ok_or_else(|| Error::InvalidConfig(format!("single_index.backend '{}' is not declared", single.backend)))?;
        builder = builder.tier(Arc::new(FixedTier::new(TierLabel::SingleIndex, backend.adapter_for(&single.collection))));
    }

    let mut embedder = None;
    if !settings.backends.is_empty() || settings.snapshot.is_some() {
        let model_dir = settings.embedding.model_dir.as_ref().map(|d| config.resolve_path(d));
        match default_embedder(model_dir.as_deref(), settings.embedding.dimension, settings.embedding.fake) {
            Ok(e) => embedder = Some(e),
            Err(e) => tracing::warn!(error = %e, "query embedder unavailable, vector tiers will be skipped"),
        }
    }

    if let Some(snapshot) = &settings.snapshot {
        let path = config.resolve_path(&snapshot.path);
        match SnapshotIndex::open(&path, &snapshot.table).await {
            Ok(index) => {
                let written_by = index.embedder_id().map(str::to_string);
                match (written_by, &embedder) {
                    (Some(written_by), Some(e)) if written_by != e.id() => tracing::warn!(
                        path = %path.display(),
                        snapshot_embedder = %written_by,
                        query_embedder = e.id(),
                        "local snapshot was written by a different embedder, tier disabled"
                    ),
                    _ => builder = builder.tier(Arc::new(FixedTier::new(TierLabel::LocalSnapshot, Arc::new(index)))),
                }
            }
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "local snapshot unavailable, tier disabled"),
        }
    }

    if let Some(keyword) = &settings.keyword {
        let docs_dir = config.resolve_path(&keyword.docs_dir);
        if !docs_dir.is_dir() {
            return Err(Error::InvalidConfig(format!("keyword.docs_dir {} is not a directory", docs_dir.display())).into());
        }
        let extensions = keyword.extensions.clone();
        let search = tokio::task::spawn_blocking(move || KeywordFileSearch::open(&docs_dir, &extensions)).await??;
        builder = builder.tier(Arc::new(FixedTier::new(TierLabel::KeywordFiles, Arc::new(search))));
    }

    if let Some(embedder) = embedder {
        builder = builder.embedder(embedder);
    }

    if let Some(path) = &settings.events.jsonl_path {
        builder = builder.sink(Arc::new(JsonlSink::new(config.resolve_path(path))));
    }

    Ok(builder.build())
}

/// Build, run a first discovery and, if `discovery.refresh_secs > 0`, keep
/// the registry refreshed in the background.
pub async fn start(config: &Config) -> Result<(Arc<KnowledgeOrchestrator>, Option<JoinHandle<()>>)> {
    let refresh_secs = config.settings()?.discovery.refresh_secs;
    let orchestrator = Arc::new(build(config).await?);
    orchestrator.registry().discover().await;
    let refresh = (refresh_secs > 0).then(|| orchestrator.registry().spawn_refresh(Duration::from_secs(refresh_secs)));
    Ok((orchestrator, refresh))
}
