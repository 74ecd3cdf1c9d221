//! Domain types shared by adapters, the registry and the orchestrator.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

pub type ChunkId = String;
pub type Meta = HashMap<String, String>;

/// Source group ("folder") a collection belongs to.
///
/// Weights are a fixed table. Labels that do not name a group fall back to
/// `Legacy`, the lowest defined weight, so an unknown group is never silently
/// weighted to zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceGroup {
    Newest,
    Recent,
    Older,
    Legacy,
}

impl SourceGroup {
    pub fn weight(self) -> f32 {
        match self {
            Self::Newest => 1.0,
            Self::Recent => 0.9,
            Self::Older => 0.8,
            Self::Legacy => 0.7,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Newest => "newest",
            Self::Recent => "recent",
            Self::Older => "older",
            Self::Legacy => "legacy",
        }
    }

    /// Parse a free-text group label, defaulting to `Legacy`.
    pub fn from_label(label: &str) -> Self {
        match label.parse::<Self>() {
            Ok(group) => group,
            Err(()) => {
                tracing::warn!(label, "unknown source group, using legacy weight");
                Self::Legacy
            }
        }
    }
}

impl FromStr for SourceGroup {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "newest" => Ok(Self::Newest),
            "recent" => Ok(Self::Recent),
            "older" => Ok(Self::Older),
            "legacy" => Ok(Self::Legacy),
            _ => Err(()),
        }
    }
}

impl fmt::Display for SourceGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One retrieval strategy in the fallback chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierLabel {
    MultiCollection,
    SingleIndex,
    LocalSnapshot,
    KeywordFiles,
}

impl TierLabel {
    pub const DEFAULT_ORDER: [TierLabel; 4] =
        [Self::MultiCollection, Self::SingleIndex, Self::LocalSnapshot, Self::KeywordFiles];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::MultiCollection => "multi_collection",
            Self::SingleIndex => "single_index",
            Self::LocalSnapshot => "local_snapshot",
            Self::KeywordFiles => "keyword_files",
        }
    }
}

impl FromStr for TierLabel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "multi_collection" => Ok(Self::MultiCollection),
            "single_index" => Ok(Self::SingleIndex),
            "local_snapshot" => Ok(Self::LocalSnapshot),
            "keyword_files" => Ok(Self::KeywordFiles),
            other => Err(format!("unknown tier '{other}'")),
        }
    }
}

impl fmt::Display for TierLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared, mutable health state of a collection.
///
/// Clones share the same state, so a collection carried from one registry
/// snapshot into the next keeps its history.
#[derive(Debug, Clone, Default)]
pub struct HealthMark(Arc<HealthState>);

#[derive(Debug, Default)]
struct HealthState {
    healthy: AtomicBool,
    last_seen_ms: AtomicI64,
}

impl HealthMark {
    pub fn healthy_now() -> Self {
        let mark = Self::default();
        mark.mark_seen();
        mark
    }

    pub fn mark_seen(&self) {
        self.0.healthy.store(true, Ordering::Release);
        self.0.last_seen_ms.store(Utc::now().timestamp_millis(), Ordering::Release);
    }

    pub fn mark_unhealthy(&self) {
        self.0.healthy.store(false, Ordering::Release);
    }

    pub fn is_healthy(&self) -> bool {
        self.0.healthy.load(Ordering::Acquire)
    }

    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        match self.0.last_seen_ms.load(Ordering::Acquire) {
            0 => None,
            ms => Utc.timestamp_millis_opt(ms).single(),
        }
    }
}

/// A named, weighted group of indexed content hosted by one backend.
#[derive(Debug, Clone, Serialize)]
pub struct Collection {
    pub name: String,
    pub backend: String,
    pub group: SourceGroup,
    pub dimension: Option<usize>,
    #[serde(skip)]
    pub health: HealthMark,
}

impl Collection {
    pub fn new(backend: impl Into<String>, name: impl Into<String>, group: SourceGroup) -> Self {
        Self {
            name: name.into(),
            backend: backend.into(),
            group,
            dimension: None,
            health: HealthMark::healthy_now(),
        }
    }

    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.dimension = Some(dimension);
        self
    }

    /// Registry identity, `"<backend>/<collection>"`.
    pub fn id(&self) -> String {
        format!("{}/{}", self.backend, self.name)
    }

    pub fn weight(&self) -> f32 {
        self.group.weight()
    }

    pub fn source(&self) -> CollectionRef {
        CollectionRef { id: self.id(), weight: self.weight() }
    }

    pub fn status(&self) -> CollectionStatus {
        CollectionStatus {
            id: self.id(),
            group: self.group,
            weight: self.weight(),
            dimension: self.dimension,
            healthy: self.health.is_healthy(),
            last_seen_healthy: self.health.last_seen(),
        }
    }
}

/// Serializable view of a collection for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionStatus {
    pub id: String,
    pub group: SourceGroup,
    pub weight: f32,
    pub dimension: Option<usize>,
    pub healthy: bool,
    pub last_seen_healthy: Option<DateTime<Utc>>,
}

/// Where a hit came from and how much that source is trusted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionRef {
    pub id: String,
    pub weight: f32,
}

impl CollectionRef {
    pub fn new(id: impl Into<String>, weight: f32) -> Self {
        Self { id: id.into(), weight }
    }

    /// Collection name without the backend prefix.
    pub fn name(&self) -> &str {
        self.id.rsplit_once('/').map_or(self.id.as_str(), |(_, name)| name)
    }
}

/// A chunk of indexed content as returned by a backend.
///
/// Owned by the ingestion side; the orchestrator only reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: ChunkId,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector: Option<Vec<f32>>,
    #[serde(default)]
    pub metadata: Meta,
}

impl Chunk {
    pub fn new(id: impl Into<ChunkId>, text: impl Into<String>) -> Self {
        Self { id: id.into(), text: text.into(), vector: None, metadata: Meta::new() }
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Key under which two hits count as the same logical chunk.
    ///
    /// Prefers a supplied `content_hash`, then `path`/`source` plus
    /// `offset`/`chunk_index`, then the chunk id.
    pub fn identity_key(&self) -> String {
        if let Some(hash) = self.metadata.get("content_hash") {
            return format!("hash:{hash}");
        }
        let location = self.metadata.get("path").or_else(|| self.metadata.get("source"));
        let offset = self.metadata.get("offset").or_else(|| self.metadata.get("chunk_index"));
        if let (Some(location), Some(offset)) = (location, offset) {
            return format!("loc:{location}#{offset}");
        }
        format!("id:{}", self.id)
    }
}

/// Hash chunk text the way snapshot writers record `content_hash`.
pub fn content_hash(text: &str) -> String {
    blake3::hash(text.as_bytes()).to_hex().to_string()
}

/// A scored reference to a chunk from one collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hit {
    pub chunk: Chunk,
    pub score: f32,
    pub collection: CollectionRef,
}

/// A hit with its composite score and the tier that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedResult {
    pub hit: Hit,
    pub composite: f32,
    pub tier: TierLabel,
}

/// Equality predicate over chunk metadata. Every entry must match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataFilter {
    pub must: BTreeMap<String, String>,
}

impl MetadataFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.must.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.must.is_empty()
    }

    pub fn matches(&self, metadata: &Meta) -> bool {
        self.must.iter().all(|(k, v)| metadata.get(k) == Some(v))
    }
}

/// A query as front ends submit it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryRequest {
    pub text: String,
    #[serde(default)]
    pub filter: Option<MetadataFilter>,
    #[serde(default)]
    pub tier_order: Option<Vec<TierLabel>>,
    #[serde(default)]
    pub top_n: Option<usize>,
    #[serde(default, with = "opt_millis")]
    pub deadline: Option<Duration>,
}

impl QueryRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into(), ..Self::default() }
    }

    pub fn with_filter(mut self, filter: MetadataFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_tier_order(mut self, order: Vec<TierLabel>) -> Self {
        self.tier_order = Some(order);
        self
    }

    pub fn with_top_n(mut self, top_n: usize) -> Self {
        self.top_n = Some(top_n);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

mod opt_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

/// A request resolved for execution: absolute deadline and, for vector
/// backends, the query embedding.
#[derive(Debug, Clone)]
pub struct PreparedQuery {
    pub text: String,
    pub filter: Option<MetadataFilter>,
    pub embedding: Option<Arc<[f32]>>,
    pub deadline: Instant,
}

impl PreparedQuery {
    pub fn new(text: impl Into<String>, deadline: Instant) -> Self {
        Self { text: text.into(), filter: None, embedding: None, deadline }
    }

    pub fn with_filter(mut self, filter: Option<MetadataFilter>) -> Self {
        self.filter = filter.filter(|f| !f.is_empty());
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding.into());
        self
    }

    pub fn accepts(&self, metadata: &Meta) -> bool {
        self.filter.as_ref().map_or(true, |f| f.matches(metadata))
    }
}
