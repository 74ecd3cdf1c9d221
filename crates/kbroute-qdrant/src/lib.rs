//! kbroute-qdrant
//!
//! Qdrant-backed `IndexAdapter` and `CollectionSource` over the REST API.
#![deny(warnings)]
#![deny(dead_code, unused_variables, unused_imports)]

pub mod adapter;
pub mod client;

pub use adapter::{QdrantAdapter, QdrantBackend};
pub use client::{QdrantClient, QdrantError};
