//! Thin async client for the subset of the Qdrant REST API the router needs:
//! listing collections, reading a collection's vector size, and point search.

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use kbroute_core::config::BackendSettings;
use kbroute_core::error::AdapterFailure;
use kbroute_core::types::MetadataFilter;

#[derive(Debug, Error)]
pub enum QdrantError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("status {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("undecodable response: {0}")]
    Decode(String),

    #[error("deadline passed")]
    DeadlineExceeded,

    #[error("Invalid configuration: {0}")]
    Config(String),
}

pub type QdrantResult<T> = Result<T, QdrantError>;

impl From<QdrantError> for AdapterFailure {
    fn from(err: QdrantError) -> Self {
        match &err {
            QdrantError::Http(e) if e.is_timeout() => AdapterFailure::timeout(err.to_string()),
            QdrantError::Http(e) if e.is_decode() => AdapterFailure::bad_response(err.to_string()),
            QdrantError::Http(_) => AdapterFailure::unreachable(err.to_string()),
            QdrantError::Status { status, .. }
                if matches!(
                    *status,
                    StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
                ) =>
            {
                AdapterFailure::unreachable(err.to_string())
            }
            QdrantError::Status { .. } | QdrantError::Decode(_) => AdapterFailure::bad_response(err.to_string()),
            QdrantError::DeadlineExceeded => AdapterFailure::timeout(err.to_string()),
            QdrantError::Config(_) => AdapterFailure::bad_response(err.to_string()),
        }
    }
}

/// One point returned by `points/search`.
#[derive(Debug, Clone, Deserialize)]
pub struct ScoredPoint {
    pub id: Value,
    pub score: f32,
    #[serde(default)]
    pub payload: Option<serde_json::Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    result: T,
}

#[derive(Debug, Deserialize)]
struct CollectionList {
    collections: Vec<CollectionName>,
}

#[derive(Debug, Deserialize)]
struct CollectionName {
    name: String,
}

#[derive(Debug, Serialize)]
struct SearchBody<'a> {
    vector: &'a [f32],
    limit: usize,
    with_payload: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    filter: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct QdrantClient {
    base_url: String,
    api_key: Option<String>,
    http: Client,
}

impl QdrantClient {
    pub fn new(settings: &BackendSettings) -> QdrantResult<Self> {
        let base_url = settings.url.trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(QdrantError::Config(format!("backend '{}' has an empty url", settings.name)));
        }
        let mut builder = Client::builder().timeout(Duration::from_millis(settings.timeout_ms));
        // Env proxies are opt-in per backend.
        if !settings.use_env_proxy {
            builder = builder.no_proxy();
        }
        let http = builder.build()?;
        Ok(Self { base_url, api_key: settings.api_key.clone(), http })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let req = self.http.request(method, format!("{}{}", self.base_url, path));
        match &self.api_key {
            Some(key) => req.header("api-key", key),
            None => req,
        }
    }

    async fn decode<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> QdrantResult<T> {
        let status = resp.status();
        let bytes = resp.bytes().await?;
        if !status.is_success() {
            let body = String::from_utf8_lossy(&bytes).chars().take(200).collect();
            return Err(QdrantError::Status { status, body });
        }
        let envelope: Envelope<T> =
            serde_json::from_slice(&bytes).map_err(|e| QdrantError::Decode(e.to_string()))?;
        Ok(envelope.result)
    }

    /// Names of every collection hosted by this instance.
    pub async fn list_collections(&self) -> QdrantResult<Vec<String>> {
        let resp = self.request(reqwest::Method::GET, "/collections").send().await?;
        let list: CollectionList = Self::decode(resp).await?;
        Ok(list.collections.into_iter().map(|c| c.name).collect())
    }

    /// Vector size of `collection`, if its config declares one.
    ///
    /// Collections with named vectors report the size of the first entry.
    pub async fn collection_dimension(&self, collection: &str) -> QdrantResult<Option<usize>> {
        let resp = self
            .request(reqwest::Method::GET, &format!("/collections/{collection}"))
            .send()
            .await?;
        let info: Value = Self::decode(resp).await?;
        let vectors = info.pointer("/config/params/vectors");
        let size = match vectors {
            Some(v) if v.get("size").is_some() => v.get("size").and_then(Value::as_u64),
            Some(Value::Object(named)) => named.values().find_map(|v| v.get("size").and_then(Value::as_u64)),
            _ => None,
        };
        Ok(size.map(|s| s as usize))
    }

    /// Nearest points to `vector`, bounded by `deadline`.
    pub async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
        filter: Option<&MetadataFilter>,
        deadline: Instant,
    ) -> QdrantResult<Vec<ScoredPoint>> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(QdrantError::DeadlineExceeded);
        }
        let body = SearchBody { vector, limit, with_payload: true, filter: filter.map(filter_json) };
        let call = async {
            let resp = self
                .request(reqwest::Method::POST, &format!("/collections/{collection}/points/search"))
                .timeout(remaining)
                .json(&body)
                .send()
                .await?;
            Self::decode::<Vec<ScoredPoint>>(resp).await
        };
        match tokio::time::timeout_at(deadline, call).await {
            Ok(res) => res,
            Err(_) => Err(QdrantError::DeadlineExceeded),
        }
    }
}

/// Qdrant `must` filter with one exact-match condition per entry.
pub fn filter_json(filter: &MetadataFilter) -> Value {
    let must: Vec<Value> = filter
        .must
        .iter()
        .map(|(k, v)| serde_json::json!({ "key": k, "match": { "value": v } }))
        .collect();
    serde_json::json!({ "must": must })
}
