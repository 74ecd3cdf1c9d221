use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tantivy::{doc, Index, IndexReader, IndexWriter, TantivyDocument};
use tantivy::collector::TopDocs;
use tantivy::query::QueryParser;
use tantivy::schema::{Field, Value};
use tokio::time::Instant;

use kbroute_core::error::AdapterFailure;
use kbroute_core::traits::IndexAdapter;
use kbroute_core::types::{Chunk, CollectionRef, Hit, Meta, MetadataFilter, PreparedQuery};

use crate::chunking::DocumentChunker;
use crate::tantivy_utils::{build_schema, register_tokenizer};

/// Collection id reported on keyword hits.
pub const KEYWORD_COLLECTION: &str = "keyword_files";

const FILTER_OVERFETCH: usize = 4;

/// In-RAM BM25 index over one chunked document directory.
pub struct LoadedIndex {
	index: Index,
	reader: IndexReader,
	id_field: Field,
	text_field: Field,
	metadata_field: Field,
	doc_count: usize,
}

impl LoadedIndex {
	pub fn build(chunks: &[Chunk]) -> Result<Self> {
		let schema = build_schema();
		let index = Index::create_in_ram(schema.clone());
		register_tokenizer(&index);
		let id_field = schema.get_field("id")?;
		let text_field = schema.get_field("text")?;
		let metadata_field = schema.get_field("metadata")?;
		let mut index_writer: IndexWriter = index.writer(50_000_000)?;
		for c in chunks {
			index_writer.add_document(doc!(
				id_field => c.id.clone(),
				text_field => c.text.clone(),
				metadata_field => serde_json::to_string(&c.metadata)?,
			))?;
		}
		index_writer.commit()?;
		let reader = index.reader()?;
		reader.reload()?;
		Ok(Self { index, reader, id_field, text_field, metadata_field, doc_count: chunks.len() })
	}

	pub fn doc_count(&self) -> usize { self.doc_count }

	/// Top `limit` chunks for `query_text`, scores divided by the best score.
	///
	/// Query syntax errors are tolerated; unparsable parts are dropped.
	pub fn search(&self, query_text: &str, filter: Option<&MetadataFilter>, limit: usize) -> Result<Vec<Hit>> {
		if limit == 0 || query_text.trim().is_empty() { return Ok(vec![]); }
		let searcher = self.reader.searcher();
		let query_parser = QueryParser::for_index(&self.index, vec![self.text_field]);
		let (query, errors) = query_parser.parse_query_lenient(query_text);
		if !errors.is_empty() {
			tracing::debug!(query = query_text, errors = errors.len(), "lenient keyword parse dropped terms");
		}
		let fetch = if filter.is_some() { limit * FILTER_OVERFETCH } else { limit };
		let top_docs = searcher.search(&query, &TopDocs::with_limit(fetch))?;
		let best = top_docs.first().map(|(s, _)| *s).unwrap_or(0.0);
		let mut hits = Vec::with_capacity(top_docs.len());
		for (score, addr) in top_docs {
			let doc: TantivyDocument = searcher.doc(addr)?;
			let id = doc.get_first(self.id_field).and_then(|v| v.as_str()).unwrap_or("").to_string();
			let text = doc.get_first(self.text_field).and_then(|v| v.as_str()).unwrap_or("").to_string();
			let metadata: Meta = doc
				.get_first(self.metadata_field)
				.and_then(|v| v.as_str())
				.and_then(|s| serde_json::from_str(s).ok())
				.unwrap_or_default();
			if filter.is_some_and(|f| !f.matches(&metadata)) { continue; }
			let normalized = if best > 0.0 { score / best } else { 0.0 };
			let chunk = Chunk { id, text, vector: None, metadata };
			hits.push(Hit { chunk, score: normalized, collection: CollectionRef::new(KEYWORD_COLLECTION, 1.0) });
			if hits.len() == limit { break; }
		}
		Ok(hits)
	}
}

/// Keyword search over a directory of plain-text documents.
///
/// The directory is chunked and indexed at open; `refresh` rebuilds the
/// index and swaps it in while in-flight searches keep the old one.
pub struct KeywordFileSearch {
	docs_dir: PathBuf,
	extensions: Vec<String>,
	chunker: DocumentChunker,
	state: RwLock<Arc<LoadedIndex>>,
	name: String,
}

impl KeywordFileSearch {
	pub fn open(docs_dir: &Path, extensions: &[String]) -> Result<Self> {
		Self::with_chunker(docs_dir, extensions, DocumentChunker::default())
	}

	pub fn with_chunker(docs_dir: &Path, extensions: &[String], chunker: DocumentChunker) -> Result<Self> {
		if !docs_dir.is_dir() {
			return Err(anyhow!("keyword docs_dir {} is not a directory", docs_dir.display()));
		}
		let loaded = LoadedIndex::build(&chunker.chunk_directory(docs_dir, extensions)?)?;
		tracing::info!(docs_dir = %docs_dir.display(), chunks = loaded.doc_count(), "keyword index built");
		Ok(Self {
			docs_dir: docs_dir.to_path_buf(),
			extensions: extensions.to_vec(),
			chunker,
			state: RwLock::new(Arc::new(loaded)),
			name: format!("keyword:{}", docs_dir.display()),
		})
	}

	/// The index searches currently run against.
	pub fn current(&self) -> Arc<LoadedIndex> {
		self.state.read().unwrap_or_else(|e| e.into_inner()).clone()
	}

	/// Re-read the directory and swap in a fresh index; returns the chunk count.
	pub fn refresh(&self) -> Result<usize> {
		let loaded = LoadedIndex::build(&self.chunker.chunk_directory(&self.docs_dir, &self.extensions)?)?;
		let count = loaded.doc_count();
		let mut guard = self.state.write().unwrap_or_else(|e| e.into_inner());
		tracing::debug!(old_count = guard.doc_count(), new_count = count, "replacing keyword index");
		*guard = Arc::new(loaded);
		Ok(count)
	}
}

#[async_trait]
impl IndexAdapter for KeywordFileSearch {
	fn name(&self) -> &str { &self.name }

	fn needs_embedding(&self) -> bool { false }

	async fn query(&self, query: &PreparedQuery, top_k: usize, deadline: Instant) -> Result<Vec<Hit>, AdapterFailure> {
		let loaded = self.current();
		let text = query.text.clone();
		let filter = query.filter.clone();
		let task = tokio::task::spawn_blocking(move || loaded.search(&text, filter.as_ref(), top_k));
		match tokio::time::timeout_at(deadline, task).await {
			Ok(Ok(Ok(hits))) => Ok(hits),
			Ok(Ok(Err(e))) => Err(AdapterFailure::bad_response(e.to_string())),
			Ok(Err(join)) => Err(AdapterFailure::bad_response(format!("keyword search task failed: {join}"))),
			Err(_) => Err(AdapterFailure::timeout(format!("{} passed its deadline", self.name))),
		}
	}
}
