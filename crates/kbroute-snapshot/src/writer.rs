use anyhow::{anyhow, Result};
use indicatif::{ProgressBar, ProgressStyle};
use lancedb::Connection;
use arrow_array::{FixedSizeListArray, RecordBatch, RecordBatchIterator, StringArray};
use std::path::Path;
use std::sync::Arc;

use kbroute_core::traits::Embedder;
use kbroute_core::types::{content_hash, Chunk};

use crate::schema::{snapshot_schema, vector_dim};
use crate::table::{meta_table_name, open_db, set_meta, table_exists};

const DEFAULT_BATCH_SIZE: usize = 1000;

struct SnapshotRow {
	id: String,
	collection: String,
	text: String,
	metadata: String,
	content_hash: String,
	vector: Vec<f32>,
}

/// Writes chunks into an on-disk LanceDB snapshot that the local tier searches.
///
/// Chunks without a vector are embedded with the writer's embedder. A table
/// keeps the dimension it was created with; writes with another width fail.
pub struct SnapshotWriter {
	db: Connection,
	table_name: String,
	embedder: Arc<dyn Embedder>,
	batch_size: usize,
	progress: bool,
}

impl SnapshotWriter {
	pub async fn open(db_path: &Path, table_name: &str, embedder: Arc<dyn Embedder>) -> Result<Self> {
		let db = open_db(db_path.to_string_lossy().as_ref()).await?;
		Ok(Self { db, table_name: table_name.to_string(), embedder, batch_size: DEFAULT_BATCH_SIZE, progress: false })
	}

	pub fn with_batch_size(mut self, batch_size: usize) -> Self {
		self.batch_size = batch_size.max(1);
		self
	}

	/// Draw a progress bar on stderr while writing.
	pub fn with_progress(mut self, progress: bool) -> Self {
		self.progress = progress;
		self
	}

	/// Append `chunks` under `collection`; returns the number of rows written.
	pub async fn write(&self, collection: &str, chunks: &[Chunk]) -> Result<usize> {
		if chunks.is_empty() { return Ok(0); }
		let dim = self.embedder.dim();
		self.check_existing_dim(dim).await?;
		tracing::info!(table = %self.table_name, collection, chunks = chunks.len(), "writing snapshot");

		let pb = if self.progress { ProgressBar::new(chunks.len() as u64) } else { ProgressBar::hidden() };
		pb.set_style(ProgressStyle::default_bar().template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} chunks ({percent}%) {msg}")?.progress_chars("#>-"));
		let mut written = 0usize;
		let mut batch = Vec::with_capacity(self.batch_size.min(chunks.len()));
		for chunk in chunks {
			let vector = match &chunk.vector {
				Some(v) => v.clone(),
				None => self.embedder.embed(&chunk.text)?,
			};
			if vector.len() != dim {
				return Err(anyhow!("chunk {} has a {}-dim vector, snapshot expects {}", chunk.id, vector.len(), dim));
			}
			let hash = chunk.metadata.get("content_hash").cloned().unwrap_or_else(|| content_hash(&chunk.text));
			batch.push(SnapshotRow {
				id: chunk.id.clone(),
				collection: collection.to_string(),
				text: chunk.text.clone(),
				metadata: serde_json::to_string(&chunk.metadata)?,
				content_hash: hash,
				vector,
			});
			pb.inc(1);
			if batch.len() >= self.batch_size {
				written += self.insert_batch(&batch, dim).await?;
				batch.clear();
			}
		}
		written += self.insert_batch(&batch, dim).await?;
		pb.finish_with_message("snapshot written");

		let meta = meta_table_name(&self.table_name);
		set_meta(&self.db, &meta, "embedder", self.embedder.id()).await?;
		tracing::info!(table = %self.table_name, written, "snapshot write finished");
		Ok(written)
	}

	async fn check_existing_dim(&self, dim: usize) -> Result<()> {
		if !table_exists(&self.db, &self.table_name).await? { return Ok(()); }
		let schema = self.db.open_table(&self.table_name).execute().await?.schema().await?;
		match vector_dim(&schema) {
			Some(existing) if existing != dim => Err(anyhow!("snapshot table '{}' stores {}-dim vectors, embedder produces {}", self.table_name, existing, dim)),
			_ => Ok(()),
		}
	}

	async fn insert_batch(&self, rows: &[SnapshotRow], dim: usize) -> Result<usize> {
		if rows.is_empty() { return Ok(0); }
		let record_batch = rows_to_record_batch(rows, dim)?;
		let schema = record_batch.schema();
		let reader = Box::new(RecordBatchIterator::new(vec![Ok(record_batch)].into_iter(), schema));
		if table_exists(&self.db, &self.table_name).await? {
			self.db.open_table(&self.table_name).execute().await?.add(reader).execute().await?;
		} else {
			self.db.create_table(&self.table_name, reader).execute().await?;
		}
		Ok(rows.len())
	}
}

fn rows_to_record_batch(rows: &[SnapshotRow], dim: usize) -> Result<RecordBatch> {
	let width = i32::try_from(dim)?;
	let vectors = rows.iter().map(|r| Some(r.vector.iter().map(|&x| Some(x)).collect::<Vec<_>>()));
	let record_batch = RecordBatch::try_new(snapshot_schema(width), vec![
		Arc::new(StringArray::from_iter_values(rows.iter().map(|r| r.id.as_str()))),
		Arc::new(StringArray::from_iter_values(rows.iter().map(|r| r.collection.as_str()))),
		Arc::new(StringArray::from_iter_values(rows.iter().map(|r| r.text.as_str()))),
		Arc::new(StringArray::from_iter_values(rows.iter().map(|r| r.metadata.as_str()))),
		Arc::new(StringArray::from_iter_values(rows.iter().map(|r| r.content_hash.as_str()))),
		Arc::new(FixedSizeListArray::from_iter_primitive::<arrow_array::types::Float32Type, _, _>(vectors, width)),
	])?;
	Ok(record_batch)
}
