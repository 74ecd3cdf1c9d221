//! kbroute-text
//!
//! Keyword tier: chunks a document directory and serves BM25 search over it
//! from an in-RAM tantivy index.
#![deny(warnings)]
#![deny(dead_code, unused_variables, unused_imports)]

pub mod chunking;
pub mod search;
pub mod tantivy_utils;

pub use chunking::{ChunkingConfig, DocumentChunker};
pub use search::{KeywordFileSearch, LoadedIndex, KEYWORD_COLLECTION};
