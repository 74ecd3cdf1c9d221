use anyhow::{anyhow, Result};
use async_trait::async_trait;
use arrow_array::{Array, Float32Array, RecordBatch, StringArray};
use futures::TryStreamExt;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::{DistanceType, Table};
use std::path::Path;
use tokio::time::Instant;

use kbroute_core::error::AdapterFailure;
use kbroute_core::traits::IndexAdapter;
use kbroute_core::types::{Chunk, CollectionRef, Hit, Meta, PreparedQuery};

use crate::schema::vector_dim;
use crate::table::{get_meta, meta_table_name, open_db, table_exists};

/// Rows fetched per requested hit when a metadata filter is post-applied.
const FILTER_OVERFETCH: usize = 4;

/// Read side of a snapshot table, queried by cosine similarity.
pub struct SnapshotIndex {
	table: Table,
	name: String,
	dim: usize,
	embedder_id: Option<String>,
}

impl SnapshotIndex {
	pub async fn open(db_path: &Path, table_name: &str) -> Result<Self> {
		let db = open_db(db_path.to_string_lossy().as_ref()).await?;
		if !table_exists(&db, table_name).await? {
			return Err(anyhow!("snapshot table '{}' not found in {}", table_name, db_path.display()));
		}
		let table = db.open_table(table_name).execute().await?;
		let schema = table.schema().await?;
		let dim = vector_dim(&schema).ok_or_else(|| anyhow!("snapshot table '{}' has no vector column", table_name))?;
		let embedder_id = get_meta(&db, &meta_table_name(table_name), "embedder").await?;
		tracing::info!(table = table_name, dim, embedder = ?embedder_id, "snapshot opened");
		Ok(Self { table, name: format!("snapshot:{table_name}"), dim, embedder_id })
	}

	pub fn dim(&self) -> usize {
		self.dim
	}

	/// Embedder id recorded by the writer, if any.
	pub fn embedder_id(&self) -> Option<&str> {
		self.embedder_id.as_deref()
	}

	pub async fn count(&self) -> Result<usize> {
		Ok(self.table.count_rows(None).await?)
	}

	async fn search(&self, query: &PreparedQuery, vector: &[f32], top_k: usize) -> Result<Vec<Hit>> {
		let limit = if query.filter.is_some() { top_k * FILTER_OVERFETCH } else { top_k };
		let mut stream = self
			.table
			.vector_search(vector.to_vec())?
			.distance_type(DistanceType::Cosine)
			.limit(limit)
			.execute()
			.await?;
		let mut hits = Vec::new();
		while let Some(batch) = stream.try_next().await? {
			for hit in batch_to_hits(&batch)? {
				if query.accepts(&hit.chunk.metadata) {
					hits.push(hit);
				}
			}
		}
		hits.truncate(top_k);
		Ok(hits)
	}
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
	batch
		.column_by_name(name)
		.and_then(|c| c.as_any().downcast_ref::<StringArray>())
		.ok_or_else(|| anyhow!("snapshot column '{}' missing", name))
}

fn batch_to_hits(batch: &RecordBatch) -> Result<Vec<Hit>> {
	let ids = string_column(batch, "id")?;
	let collections = string_column(batch, "collection")?;
	let texts = string_column(batch, "text")?;
	let metadata = string_column(batch, "metadata")?;
	let hashes = string_column(batch, "content_hash")?;
	let distances = batch
		.column_by_name("_distance")
		.and_then(|c| c.as_any().downcast_ref::<Float32Array>())
		.ok_or_else(|| anyhow!("search result has no _distance column"))?;

	let mut hits = Vec::with_capacity(batch.num_rows());
	for i in 0..batch.num_rows() {
		let mut meta: Meta = serde_json::from_str(metadata.value(i)).unwrap_or_default();
		meta.entry("content_hash".to_string()).or_insert_with(|| hashes.value(i).to_string());
		let score = if distances.is_null(i) { 0.0 } else { 1.0 - distances.value(i) };
		let chunk = Chunk { id: ids.value(i).to_string(), text: texts.value(i).to_string(), vector: None, metadata: meta };
		hits.push(Hit { chunk, score, collection: CollectionRef::new(format!("snapshot/{}", collections.value(i)), 1.0) });
	}
	Ok(hits)
}

#[async_trait]
impl IndexAdapter for SnapshotIndex {
	fn name(&self) -> &str {
		&self.name
	}

	async fn query(&self, query: &PreparedQuery, top_k: usize, deadline: Instant) -> Result<Vec<Hit>, AdapterFailure> {
		let Some(vector) = query.embedding.as_deref() else {
			return Err(AdapterFailure::bad_response("query has no embedding"));
		};
		if vector.len() != self.dim {
			return Err(AdapterFailure::bad_response(format!("query embedding has {} dims, snapshot stores {}", vector.len(), self.dim)));
		}
		match tokio::time::timeout_at(deadline, self.search(query, vector, top_k)).await {
			Ok(Ok(hits)) => Ok(hits),
			Ok(Err(e)) => Err(AdapterFailure::bad_response(e.to_string())),
			Err(_) => Err(AdapterFailure::timeout(format!("{} passed its deadline", self.name))),
		}
	}
}
