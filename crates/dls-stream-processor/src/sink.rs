// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Sink writer: idempotent bulk upserts against the search backend.
//!
//! Every document carries a deterministic id (window key or record
//! coordinates), so a replay after checkpoint recovery overwrites instead of
//! duplicating. Batches accumulate up to a size or time threshold; transient
//! backend failures retry the whole batch with backoff inside a bounded
//! budget, after which the writer reports `SinkError::Unavailable` and the
//! pipeline halts rather than marking progress past unacknowledged data.
//! Per-document rejects are isolated: the rejected document is counted,
//! logged, and dead-lettered terminally (the sink already refused it, so it
//! is not re-queued), while the rest of the batch acknowledges.

use crate::metrics::{incr, incr_by, PipelineMetrics};
use crate::record::{AggregateResult, DeadLetter, LogLevel};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, thiserror::Error)]
pub enum SinkError {
    /// Backend timeout or 5xx; retried with backoff.
    #[error("transient sink failure: {0}")]
    Transient(String),

    /// Retry budget exhausted. Checkpoint advancement must stop.
    #[error("sink unavailable after {attempts} attempts")]
    Unavailable { attempts: u32 },

    /// The backend answered with something the writer cannot interpret.
    #[error("invalid sink response: {0}")]
    InvalidResponse(String),
}

/// One upsert against the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkDocument {
    pub document_id: String,
    pub payload: serde_json::Value,
}

/// Per-document outcome of a bulk upsert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentStatus {
    Indexed,
    Rejected(String),
}

/// Bulk-upsert seam toward the search backend. Assumed idempotent on
/// duplicate `document_id`.
#[async_trait]
pub trait BulkSink: Send + Sync {
    async fn bulk_upsert(&self, documents: &[SinkDocument])
        -> Result<Vec<DocumentStatus>, SinkError>;
}

pub fn window_document(result: &AggregateResult) -> SinkDocument {
    let mut levels = serde_json::Map::new();
    for level in LogLevel::ALL {
        levels.insert(
            level.as_str().to_string(),
            result.accumulator.level_count(level).into(),
        );
    }
    SinkDocument {
        document_id: result.document_id(),
        payload: json!({
            "type": "window_aggregate",
            "grouping_key": result.key.grouping_key,
            "window_start_ms": result.key.window_start_ms,
            "window_end_ms": result.key.window_end_ms,
            "count": result.accumulator.count,
            "levels": levels,
            "synthetic_time_count": result.accumulator.synthetic_time_count,
            "min_event_time_ms": result.accumulator.min_event_time_ms,
            "max_event_time_ms": result.accumulator.max_event_time_ms,
            "enrichment": result.enrichment,
            "enrichment_incomplete": result.enrichment_incomplete,
            "correction": result.correction,
        }),
    }
}

pub fn dead_letter_document(dead: &DeadLetter) -> SinkDocument {
    SinkDocument {
        document_id: dead.document_id(),
        payload: json!({
            "type": "dead_letter",
            "partition": dead.partition,
            "offset": dead.offset,
            "reason": dead.reason,
            "payload": String::from_utf8_lossy(&dead.payload),
        }),
    }
}

/// Retry budget for whole-batch transient failures.
#[derive(Debug, Clone)]
pub struct SinkRetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
    /// Wall-clock ceiling across all attempts of one batch.
    pub max_elapsed: Duration,
}

impl Default for SinkRetryPolicy {
    fn default() -> Self {
        SinkRetryPolicy {
            max_attempts: 5,
            base: Duration::from_millis(500),
            cap: Duration::from_secs(10),
            max_elapsed: Duration::from_secs(120),
        }
    }
}

impl SinkRetryPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base
            .saturating_mul(1u32 << attempt.min(16))
            .min(self.cap)
    }
}

#[derive(Debug, Clone)]
pub struct SinkWriterConfig {
    pub max_batch_size: usize,
    pub max_batch_wait: Duration,
    pub retry: SinkRetryPolicy,
}

impl Default for SinkWriterConfig {
    fn default() -> Self {
        SinkWriterConfig {
            max_batch_size: 500,
            max_batch_wait: Duration::from_secs(2),
            retry: SinkRetryPolicy::default(),
        }
    }
}

/// Ack accounting shared with the backpressure controller.
#[derive(Debug, Default)]
pub struct SinkStats {
    pub in_flight_batches: AtomicUsize,
    pub acked_batches: AtomicU64,
    pub total_ack_latency_ms: AtomicU64,
}

impl SinkStats {
    fn record_ack(&self, latency: Duration) {
        self.acked_batches.fetch_add(1, Ordering::Relaxed);
        self.total_ack_latency_ms
            .fetch_add(latency.as_millis() as u64, Ordering::Relaxed);
    }
}

/// Input items for the sink writer. One channel carries both emitted windows
/// and dead letters, so a `Flush` observed in order means everything enqueued
/// before it has been flushed.
#[derive(Debug)]
pub enum SinkItem {
    Result(AggregateResult),
    DeadLetter(DeadLetter),
    Flush(oneshot::Sender<Result<(), SinkError>>),
}

#[derive(Clone)]
pub struct SinkWriterHandle {
    tx: mpsc::Sender<SinkItem>,
}

impl SinkWriterHandle {
    pub fn new(tx: mpsc::Sender<SinkItem>) -> Self {
        SinkWriterHandle { tx }
    }

    /// Force out the current batch and wait until everything enqueued before
    /// this call has been acknowledged by the backend.
    pub async fn flush(&self) -> Result<(), SinkError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(SinkItem::Flush(response_tx))
            .await
            .map_err(|e| SinkError::Transient(format!("sink writer gone: {e}")))?;
        response_rx
            .await
            .map_err(|e| SinkError::Transient(format!("sink writer dropped flush ack: {e}")))?
    }
}

pub struct SinkWriter {
    sink: Arc<dyn BulkSink>,
    config: SinkWriterConfig,
    stats: Arc<SinkStats>,
    metrics: Arc<PipelineMetrics>,
}

impl SinkWriter {
    pub fn new(
        sink: Arc<dyn BulkSink>,
        config: SinkWriterConfig,
        stats: Arc<SinkStats>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        SinkWriter {
            sink,
            config,
            stats,
            metrics,
        }
    }

    /// Drain the emission queue until it closes or a fatal sink error occurs.
    /// On clean close the remaining batch is flushed before returning.
    pub async fn run(self, mut rx: mpsc::Receiver<SinkItem>) -> Result<(), SinkError> {
        debug!("Sink writer started");
        let mut pending: Vec<SinkDocument> = Vec::new();
        let mut deadline: Option<Instant> = None;

        loop {
            let wait = async {
                match deadline {
                    Some(d) => tokio::time::sleep_until(d).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                item = rx.recv() => match item {
                    Some(SinkItem::Result(result)) => {
                        pending.push(window_document(&result));
                        deadline.get_or_insert(Instant::now() + self.config.max_batch_wait);
                        if pending.len() >= self.config.max_batch_size {
                            self.flush_pending(&mut pending, &mut deadline).await?;
                        }
                    }
                    Some(SinkItem::DeadLetter(dead)) => {
                        pending.push(dead_letter_document(&dead));
                        deadline.get_or_insert(Instant::now() + self.config.max_batch_wait);
                        if pending.len() >= self.config.max_batch_size {
                            self.flush_pending(&mut pending, &mut deadline).await?;
                        }
                    }
                    Some(SinkItem::Flush(response_tx)) => {
                        let outcome = self.flush_pending(&mut pending, &mut deadline).await;
                        let _ = response_tx.send(outcome.clone());
                        outcome?;
                    }
                    None => {
                        self.flush_pending(&mut pending, &mut deadline).await?;
                        debug!("Sink writer stopped");
                        return Ok(());
                    }
                },
                _ = wait => {
                    self.flush_pending(&mut pending, &mut deadline).await?;
                }
            }
        }
    }

    async fn flush_pending(
        &self,
        pending: &mut Vec<SinkDocument>,
        deadline: &mut Option<Instant>,
    ) -> Result<(), SinkError> {
        *deadline = None;
        if pending.is_empty() {
            return Ok(());
        }
        let documents = std::mem::take(pending);
        let statuses = self.ship_batch(&documents).await?;

        let mut indexed = 0u64;
        for (document, status) in documents.iter().zip(statuses) {
            match status {
                DocumentStatus::Indexed => indexed += 1,
                DocumentStatus::Rejected(reason) => {
                    incr(&self.metrics.documents_rejected);
                    incr(&self.metrics.dead_letters);
                    error!(
                        document_id = %document.document_id,
                        reason = %reason,
                        payload = %document.payload,
                        "sink rejected document"
                    );
                }
            }
        }
        incr_by(&self.metrics.documents_indexed, indexed);
        incr(&self.metrics.batches_flushed);
        Ok(())
    }

    /// Ship one batch, retrying transient failures inside the retry budget.
    async fn ship_batch(
        &self,
        documents: &[SinkDocument],
    ) -> Result<Vec<DocumentStatus>, SinkError> {
        let started = Instant::now();
        let mut attempt = 0u32;

        loop {
            self.stats.in_flight_batches.fetch_add(1, Ordering::Relaxed);
            let sent_at = Instant::now();
            let outcome = self.sink.bulk_upsert(documents).await;
            self.stats.in_flight_batches.fetch_sub(1, Ordering::Relaxed);

            match outcome {
                Ok(statuses) => {
                    if statuses.len() != documents.len() {
                        return Err(SinkError::InvalidResponse(format!(
                            "{} documents sent, {} statuses returned",
                            documents.len(),
                            statuses.len()
                        )));
                    }
                    self.stats.record_ack(sent_at.elapsed());
                    return Ok(statuses);
                }
                Err(SinkError::Transient(msg)) => {
                    attempt += 1;
                    incr(&self.metrics.batch_retries);
                    if attempt >= self.config.retry.max_attempts
                        || started.elapsed() >= self.config.retry.max_elapsed
                    {
                        error!(
                            "batch of {} documents failed after {attempt} attempts: {msg}",
                            documents.len()
                        );
                        return Err(SinkError::Unavailable { attempts: attempt });
                    }
                    let delay = self.config.retry.delay(attempt - 1);
                    warn!(
                        "batch flush failed (attempt {attempt}): {msg}; retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(fatal) => return Err(fatal),
            }
        }
    }

}

/// JSON bulk-upsert client for the search backend.
pub struct HttpBulkSink {
    client: reqwest::Client,
    endpoint: String,
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    items: Vec<BulkItemStatus>,
}

#[derive(Debug, Deserialize)]
struct BulkItemStatus {
    #[allow(dead_code)]
    document_id: String,
    status: String,
    #[serde(default)]
    reason: Option<String>,
}

impl HttpBulkSink {
    pub fn new(endpoint: String, timeout: Duration) -> Result<Self, SinkError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SinkError::InvalidResponse(format!("failed to build client: {e}")))?;
        Ok(HttpBulkSink { client, endpoint })
    }
}

#[async_trait]
impl BulkSink for HttpBulkSink {
    async fn bulk_upsert(
        &self,
        documents: &[SinkDocument],
    ) -> Result<Vec<DocumentStatus>, SinkError> {
        let response = self
            .client
            .post(format!("{}/_bulk", self.endpoint))
            .json(&json!({ "documents": documents }))
            .send()
            .await
            .map_err(|e| SinkError::Transient(format!("bulk request failed: {e}")))?;

        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(SinkError::Transient(format!("backend returned {status}")));
        }
        if status.is_client_error() {
            // Permanent for the whole request: every document is rejected,
            // none will succeed on retry.
            return Ok(documents
                .iter()
                .map(|_| DocumentStatus::Rejected(format!("backend returned {status}")))
                .collect());
        }

        let body: BulkResponse = response
            .json()
            .await
            .map_err(|e| SinkError::InvalidResponse(format!("bad bulk response: {e}")))?;

        Ok(body
            .items
            .into_iter()
            .map(|item| match item.status.as_str() {
                "ok" => DocumentStatus::Indexed,
                _ => DocumentStatus::Rejected(
                    item.reason.unwrap_or_else(|| item.status.clone()),
                ),
            })
            .collect())
    }
}
