use anyhow::Result;
use std::fs;
use std::path::{Path, PathBuf};

use kbroute_core::types::Chunk;

#[derive(Debug, Clone)]
pub struct ChunkingConfig {
	pub max_tokens: usize,
	pub words_per_chunk: usize,
	pub overlap_percent: f32,
}

impl Default for ChunkingConfig {
	fn default() -> Self {
		Self { max_tokens: 500, words_per_chunk: 300, overlap_percent: 0.2 }
	}
}

/// Splits plain-text documents into paragraph chunks.
///
/// Paragraphs are separated by blank lines; a paragraph over `max_tokens`
/// is split into word windows with `overlap_percent` overlap.
#[derive(Debug, Clone, Default)]
pub struct DocumentChunker {
	config: ChunkingConfig,
}

impl DocumentChunker {
	pub fn new(config: ChunkingConfig) -> Self { Self { config } }

	/// Chunk every file under `root` whose extension is in `extensions`.
	pub fn chunk_directory(&self, root: &Path, extensions: &[String]) -> Result<Vec<Chunk>> {
		let files = list_files(root, extensions);
		let mut all_chunks = Vec::new();
		for file_path in &files {
			let content = read_file_content(file_path)?;
			all_chunks.extend(self.chunk_document(&content, file_path, root));
		}
		tracing::debug!(root = %root.display(), files = files.len(), chunks = all_chunks.len(), "chunked documents");
		Ok(all_chunks)
	}

	/// Chunk one document. Metadata carries `path`, `source` (file name),
	/// `doc_type` (parent directory relative to `root`), `chunk_index` and `total_chunks`.
	pub fn chunk_document(&self, content: &str, file_path: &Path, root: &Path) -> Vec<Chunk> {
		let source = file_path.file_name().map(|s| s.to_string_lossy().to_string()).unwrap_or_default();
		let doc_id = file_path.file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_else(|| source.clone());
		let doc_type = facet_from_path(file_path, root);
		let path = file_path.to_string_lossy().to_string();

		let mut pieces = Vec::new();
		for paragraph in content.split("\n\n") {
			let paragraph = paragraph.trim();
			if paragraph.is_empty() { continue; }
			if count_tokens(paragraph) <= self.config.max_tokens {
				pieces.push(paragraph.to_string());
			} else {
				pieces.extend(self.split_paragraph_with_overlap(paragraph));
			}
		}
		let total_chunks = pieces.len();
		pieces
			.into_iter()
			.enumerate()
			.map(|(chunk_index, text)| {
				Chunk::new(format!("{}:{}", doc_id, chunk_index), text)
					.with_meta("path", path.clone())
					.with_meta("source", source.clone())
					.with_meta("doc_type", doc_type.clone())
					.with_meta("chunk_index", chunk_index.to_string())
					.with_meta("total_chunks", total_chunks.to_string())
			})
			.collect()
	}

	fn split_paragraph_with_overlap(&self, paragraph: &str) -> Vec<String> {
		let words: Vec<&str> = paragraph.split_whitespace().collect();
		let words_per_chunk = self.config.words_per_chunk.max(1);
		let overlap_words = ((words_per_chunk as f32 * self.config.overlap_percent) as usize).min(words_per_chunk - 1);
		let mut chunks = Vec::new();
		let mut start = 0;
		while start < words.len() {
			let end = (start + words_per_chunk).min(words.len());
			chunks.push(words[start..end].join(" "));
			if end >= words.len() { break; }
			start = end - overlap_words;
		}
		chunks
	}
}

fn count_tokens(text: &str) -> usize { (text.split_whitespace().count() as f32 / 0.75) as usize }

fn read_file_content(file_path: &Path) -> Result<String> {
	match fs::read_to_string(file_path) {
		Ok(content) => Ok(content),
		Err(_) => Ok(String::from_utf8_lossy(&fs::read(file_path)?).to_string()),
	}
}

fn facet_from_path(file_path: &Path, root: &Path) -> String {
	let relative_path = file_path.strip_prefix(root).unwrap_or(file_path);
	match relative_path.parent().and_then(|p| p.to_str()) {
		Some(facet) if !facet.is_empty() => facet.to_string(),
		_ => "misc".to_string(),
	}
}

/// Files under `root` with one of `extensions` (case-insensitive), sorted.
pub fn list_files(root: &Path, extensions: &[String]) -> Vec<PathBuf> {
	let mut files: Vec<PathBuf> = walkdir::WalkDir::new(root)
		.into_iter()
		.filter_map(|e| e.ok())
		.filter(|e| e.file_type().is_file())
		.filter(|e| {
			e.path()
				.extension()
				.and_then(|s| s.to_str())
				.is_some_and(|ext| extensions.iter().any(|want| want.eq_ignore_ascii_case(ext)))
		})
		.map(|e| e.path().to_path_buf())
		.collect();
	files.sort();
	files
}
