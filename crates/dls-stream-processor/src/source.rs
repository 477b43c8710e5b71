// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Ingestion source adapter.
//!
//! The broker is an external collaborator exposing a partitioned, offset-
//! addressable log. [`RecordSource`] is the seam the pipeline consumes;
//! [`RetryingSource`] wraps any implementation with exponential backoff and a
//! consecutive-failure cutoff so transient connectivity errors never drop a
//! partition silently. [`InMemorySource`] backs tests and the loopback mode
//! of the consumer binary.

use crate::metrics::{incr, PipelineMetrics};
use crate::record::RawRecord;
use async_trait::async_trait;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// Connectivity-class failure; retried with backoff.
    #[error("transient source failure: {0}")]
    Transient(String),

    /// Retry budget exhausted. Processing halts rather than dropping
    /// partitions.
    #[error("source unavailable after {attempts} consecutive failures: {last_error}")]
    Unavailable { attempts: u32, last_error: String },

    /// A seek referenced a partition the source does not track.
    #[error("unknown partition {0}")]
    UnknownPartition(u32),

    /// A seek referenced an offset before the start of the log.
    #[error("invalid offset {offset} for partition {partition}")]
    InvalidOffset { partition: u32, offset: i64 },
}

impl SourceError {
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SourceError::Transient(_))
    }
}

/// Partitioned, offset-ordered record source.
///
/// Guarantees: records within one partition are returned in non-decreasing
/// offset order, and no record is skipped unless explicitly sought past.
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Pull up to `max_records`, waiting at most `timeout`. An empty result
    /// on timeout is not an error.
    async fn poll(&self, max_records: usize, timeout: Duration)
        -> Result<Vec<RawRecord>, SourceError>;

    /// Durably record read progress. `offsets` maps partition to the next
    /// offset to read.
    async fn commit(&self, offsets: &HashMap<u32, i64>) -> Result<(), SourceError>;

    /// Reposition read cursors, used on checkpoint recovery.
    async fn seek(&self, offsets: &HashMap<u32, i64>) -> Result<(), SourceError>;
}

/// Backoff policy for [`RetryingSource`].
#[derive(Debug, Clone)]
pub struct SourceRetryConfig {
    pub base: Duration,
    pub cap: Duration,
    /// Fraction of the delay added or removed at random, e.g. 0.2 for ±20%.
    pub jitter: f64,
    /// Consecutive failures tolerated before reporting `Unavailable`.
    pub max_consecutive_failures: u32,
}

impl Default for SourceRetryConfig {
    fn default() -> Self {
        SourceRetryConfig {
            base: Duration::from_millis(500),
            cap: Duration::from_secs(30),
            jitter: 0.2,
            max_consecutive_failures: 10,
        }
    }
}

impl SourceRetryConfig {
    /// Exponential delay for the given zero-based attempt, capped, with
    /// jitter applied.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.base.saturating_mul(1u32 << attempt.min(16));
        let capped = exp.min(self.cap);
        if self.jitter <= 0.0 {
            return capped;
        }
        let spread = capped.as_millis() as f64 * self.jitter;
        let jittered = capped.as_millis() as f64 + rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_millis(jittered.max(0.0) as u64)
    }
}

/// Wraps a [`RecordSource`] with retry-with-backoff on transient errors.
pub struct RetryingSource<S> {
    inner: S,
    config: SourceRetryConfig,
    consecutive_failures: AtomicU32,
    metrics: Arc<PipelineMetrics>,
}

impl<S: RecordSource> RetryingSource<S> {
    pub fn new(inner: S, config: SourceRetryConfig, metrics: Arc<PipelineMetrics>) -> Self {
        RetryingSource {
            inner,
            config,
            consecutive_failures: AtomicU32::new(0),
            metrics,
        }
    }

    async fn retry<T, F, Fut>(&self, op_name: &str, mut op: F) -> Result<T, SourceError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, SourceError>>,
    {
        loop {
            match op().await {
                Ok(value) => {
                    self.consecutive_failures.store(0, Ordering::Relaxed);
                    return Ok(value);
                }
                Err(SourceError::Transient(msg)) => {
                    let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                    incr(&self.metrics.source_retries);
                    if failures >= self.config.max_consecutive_failures {
                        return Err(SourceError::Unavailable {
                            attempts: failures,
                            last_error: msg,
                        });
                    }
                    let delay = self.config.delay(failures - 1);
                    warn!(
                        "{op_name} failed ({failures} consecutive): {msg}; retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(fatal) => return Err(fatal),
            }
        }
    }
}

#[async_trait]
impl<S: RecordSource> RecordSource for RetryingSource<S> {
    async fn poll(
        &self,
        max_records: usize,
        timeout: Duration,
    ) -> Result<Vec<RawRecord>, SourceError> {
        self.retry("poll", || self.inner.poll(max_records, timeout))
            .await
    }

    async fn commit(&self, offsets: &HashMap<u32, i64>) -> Result<(), SourceError> {
        self.retry("commit", || self.inner.commit(offsets)).await
    }

    async fn seek(&self, offsets: &HashMap<u32, i64>) -> Result<(), SourceError> {
        self.retry("seek", || self.inner.seek(offsets)).await
    }
}

#[async_trait]
impl<S: RecordSource + ?Sized> RecordSource for Arc<S> {
    async fn poll(
        &self,
        max_records: usize,
        timeout: Duration,
    ) -> Result<Vec<RawRecord>, SourceError> {
        self.as_ref().poll(max_records, timeout).await
    }

    async fn commit(&self, offsets: &HashMap<u32, i64>) -> Result<(), SourceError> {
        self.as_ref().commit(offsets).await
    }

    async fn seek(&self, offsets: &HashMap<u32, i64>) -> Result<(), SourceError> {
        self.as_ref().seek(offsets).await
    }
}

#[derive(Debug, Default)]
struct InMemorySourceState {
    /// Per-partition append-only record log; offsets start at 0.
    partitions: HashMap<u32, Vec<RawRecord>>,
    /// Next offset to read, per partition.
    cursors: HashMap<u32, i64>,
    /// Last committed next-offset, per partition.
    committed: HashMap<u32, i64>,
}

/// Partitioned in-memory log with the same contract as a real broker client.
#[derive(Debug, Default, Clone)]
pub struct InMemorySource {
    state: Arc<Mutex<InMemorySourceState>>,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record, assigning the next offset of the partition.
    pub fn push(&self, partition: u32, key: &[u8], payload: &[u8], received_at_ms: i64) -> i64 {
        #[allow(clippy::unwrap_used)]
        let mut state = self.state.lock().unwrap();
        let log = state.partitions.entry(partition).or_default();
        let offset = log.len() as i64;
        log.push(RawRecord {
            partition,
            offset,
            key: key.to_vec(),
            payload: payload.to_vec(),
            received_at_ms,
        });
        state.cursors.entry(partition).or_insert(0);
        offset
    }

    pub fn committed_offsets(&self) -> HashMap<u32, i64> {
        #[allow(clippy::unwrap_used)]
        let state = self.state.lock().unwrap();
        state.committed.clone()
    }

    fn take_available(&self, max_records: usize) -> Vec<RawRecord> {
        #[allow(clippy::unwrap_used)]
        let mut state = self.state.lock().unwrap();
        let mut out = Vec::new();
        let mut partitions: Vec<u32> = state.partitions.keys().copied().collect();
        partitions.sort_unstable();
        for partition in partitions {
            if out.len() >= max_records {
                break;
            }
            let cursor = *state.cursors.get(&partition).unwrap_or(&0);
            let log = &state.partitions[&partition];
            let remaining = max_records - out.len();
            let upto = ((cursor as usize) + remaining).min(log.len());
            if (cursor as usize) < upto {
                out.extend_from_slice(&log[cursor as usize..upto]);
                state.cursors.insert(partition, upto as i64);
            }
        }
        out
    }
}

#[async_trait]
impl RecordSource for InMemorySource {
    async fn poll(
        &self,
        max_records: usize,
        timeout: Duration,
    ) -> Result<Vec<RawRecord>, SourceError> {
        let records = self.take_available(max_records);
        if !records.is_empty() {
            return Ok(records);
        }
        // Nothing buffered: wait out the timeout once, then report whatever
        // arrived in the meantime (possibly nothing).
        tokio::time::sleep(timeout).await;
        Ok(self.take_available(max_records))
    }

    async fn commit(&self, offsets: &HashMap<u32, i64>) -> Result<(), SourceError> {
        #[allow(clippy::unwrap_used)]
        let mut state = self.state.lock().unwrap();
        for (&partition, &offset) in offsets {
            state.committed.insert(partition, offset);
        }
        debug!("committed offsets for {} partitions", offsets.len());
        Ok(())
    }

    async fn seek(&self, offsets: &HashMap<u32, i64>) -> Result<(), SourceError> {
        #[allow(clippy::unwrap_used)]
        let mut state = self.state.lock().unwrap();
        for (&partition, &offset) in offsets {
            if offset < 0 {
                return Err(SourceError::InvalidOffset { partition, offset });
            }
            if !state.partitions.contains_key(&partition) {
                return Err(SourceError::UnknownPartition(partition));
            }
            state.cursors.insert(partition, offset);
        }
        Ok(())
    }
}
