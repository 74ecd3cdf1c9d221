//! Per-query analytics events.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;

use kbroute_core::types::TierLabel;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryEvent {
    pub query: String,
    /// Tier that answered; `None` when every tier came back empty.
    pub tier: Option<TierLabel>,
    pub result_count: usize,
    pub latency_ms: u64,
    pub partial: bool,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait EventSink: Send + Sync {
    fn name(&self) -> &str;
    async fn emit(&self, event: &QueryEvent) -> anyhow::Result<()>;
}

/// Logs every event at info level.
pub struct TracingSink;

#[async_trait]
impl EventSink for TracingSink {
    fn name(&self) -> &str {
        "tracing"
    }

    async fn emit(&self, event: &QueryEvent) -> anyhow::Result<()> {
        tracing::info!(
            target: "kbroute::events",
            query = %event.query,
            tier = event.tier.map(|t| t.as_str()).unwrap_or("none"),
            result_count = event.result_count,
            latency_ms = event.latency_ms,
            partial = event.partial,
            "query served"
        );
        Ok(())
    }
}

/// Appends one JSON object per line to a file.
pub struct JsonlSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), lock: Mutex::new(()) }
    }
}

#[async_trait]
impl EventSink for JsonlSink {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn emit(&self, event: &QueryEvent) -> anyhow::Result<()> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        let _guard = self.lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new().create(true).append(true).open(&self.path).await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

const EVENT_QUEUE_CAPACITY: usize = 1024;
const SINK_TIMEOUT: Duration = Duration::from_secs(2);

/// Hands events to a background task that feeds every sink in order.
///
/// Queries only enqueue; a slow or hung sink delays other events, never a
/// response. When the queue is full new events are dropped.
pub struct EventDispatcher {
    tx: mpsc::Sender<QueryEvent>,
}

impl EventDispatcher {
    /// Spawn the delivery task. Must be called from within a tokio runtime.
    pub fn spawn(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        let (tx, mut rx) = mpsc::channel::<QueryEvent>(EVENT_QUEUE_CAPACITY);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                for sink in &sinks {
                    match tokio::time::timeout(SINK_TIMEOUT, sink.emit(&event)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => tracing::warn!(sink = sink.name(), error = %e, "event sink failed"),
                        Err(_) => tracing::warn!(sink = sink.name(), "event sink timed out"),
                    }
                }
            }
        });
        Self { tx }
    }

    pub fn dispatch(&self, event: QueryEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => tracing::warn!("event queue full, dropping query event"),
            Err(TrySendError::Closed(_)) => tracing::warn!("event delivery stopped, dropping query event"),
        }
    }
}
