// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The pipeline run loop.
//!
//! One task owns the poll/normalize/insert cycle and drives checkpoint
//! cadence and backpressure ticks from a single `select!`; the aggregator and
//! sink writer run as their own tasks. A fatal sink or source error stops the
//! loop instead of letting progress markers advance past unacknowledged data.

use crate::{config::PipelineConfig, error::PipelineError};
use dls_stream_processor::aggregator::Enricher;
use dls_stream_processor::aggregator_service::AggregatorService;
use dls_stream_processor::backpressure::PullRateController;
use dls_stream_processor::checkpoint::{CheckpointCoordinator, CheckpointStore};
use dls_stream_processor::dead_letter::DeadLetterQueue;
use dls_stream_processor::metrics::{incr_by, PipelineMetrics};
use dls_stream_processor::normalizer::normalize;
use dls_stream_processor::sink::{
    BulkSink, SinkError, SinkItem, SinkStats, SinkWriter, SinkWriterHandle,
};
use dls_stream_processor::source::{RecordSource, RetryingSource};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio::time::{interval, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const SINK_QUEUE_CAPACITY: usize = 1_024;

/// Status of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStatus {
    /// Restoring checkpoints and wiring stages.
    Starting,
    /// Polling and processing records.
    Running,
    /// Draining in-flight work and writing the final checkpoint.
    Stopping,
    /// Fully stopped.
    Stopped,
}

/// Handle to the running pipeline.
///
/// This handle allows checking the status and stopping the pipeline.
#[derive(Clone)]
pub struct PipelineHandle {
    status: Arc<RwLock<PipelineStatus>>,
    status_tx: broadcast::Sender<PipelineStatus>,
    cancel: CancellationToken,
    metrics: Arc<PipelineMetrics>,
}

impl PipelineHandle {
    /// Check if the pipeline is currently running.
    pub async fn is_running(&self) -> bool {
        matches!(*self.status.read().await, PipelineStatus::Running)
    }

    pub async fn status(&self) -> PipelineStatus {
        *self.status.read().await
    }

    /// Get a receiver for status updates.
    pub fn status_receiver(&self) -> broadcast::Receiver<PipelineStatus> {
        self.status_tx.subscribe()
    }

    pub fn metrics(&self) -> Arc<PipelineMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Request a graceful stop: polling ends, in-flight work drains, a final
    /// checkpoint is written.
    pub async fn stop(&self) -> Result<(), PipelineError> {
        let mut status = self.status.write().await;
        if *status == PipelineStatus::Stopped {
            return Ok(());
        }

        *status = PipelineStatus::Stopping;
        drop(status);

        let _ = self.status_tx.send(PipelineStatus::Stopping);
        self.cancel.cancel();
        Ok(())
    }

    /// Wait until the run task has fully exited.
    pub async fn wait_stopped(&self) {
        let mut rx = self.status_tx.subscribe();
        loop {
            if *self.status.read().await == PipelineStatus::Stopped {
                return;
            }
            match rx.recv().await {
                Ok(PipelineStatus::Stopped) | Err(broadcast::error::RecvError::Closed) => return,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            }
        }
    }
}

/// Assembles the processing stages and owns their lifecycle.
pub struct Pipeline {
    config: PipelineConfig,
    source: Arc<dyn RecordSource>,
    sink: Arc<dyn BulkSink>,
    store: Arc<dyn CheckpointStore>,
    enricher: Option<Arc<dyn Enricher>>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        source: Arc<dyn RecordSource>,
        sink: Arc<dyn BulkSink>,
        store: Arc<dyn CheckpointStore>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        Ok(Self {
            config,
            source,
            sink,
            store,
            enricher: None,
        })
    }

    pub fn with_enricher(mut self, enricher: Arc<dyn Enricher>) -> Self {
        self.enricher = Some(enricher);
        self
    }

    /// Start the pipeline.
    ///
    /// Restores the latest checkpoint if one exists, then begins polling.
    /// Returns a handle that can be used to monitor and control the run.
    pub async fn start(self) -> Result<PipelineHandle, PipelineError> {
        let status = Arc::new(RwLock::new(PipelineStatus::Starting));
        let (status_tx, _status_rx) = broadcast::channel(16);
        let cancel = CancellationToken::new();
        let metrics = Arc::new(PipelineMetrics::default());

        let handle = PipelineHandle {
            status: Arc::clone(&status),
            status_tx: status_tx.clone(),
            cancel: cancel.clone(),
            metrics: Arc::clone(&metrics),
        };

        let status_clone = Arc::clone(&status);
        let status_tx_clone = status_tx.clone();
        // Subscribe before spawning so the first transition cannot be missed.
        let mut status_rx = status_tx_clone.subscribe();
        tokio::spawn(async move {
            if let Err(e) = self.run(metrics, cancel, &status, status_tx).await {
                error!("Pipeline error: {e}");
            }
            // Ensure we mark as stopped on any exit path
            let mut s = status_clone.write().await;
            *s = PipelineStatus::Stopped;
            drop(s);
            let _ = status_tx_clone.send(PipelineStatus::Stopped);
        });

        // Wait for the pipeline to leave the Starting state
        if *handle.status.read().await == PipelineStatus::Starting {
            let _ = tokio::time::timeout(Duration::from_secs(5), async {
                loop {
                    match status_rx.recv().await {
                        Ok(PipelineStatus::Starting) => {}
                        Ok(_) | Err(_) => break,
                    }
                }
            })
            .await;
        }

        Ok(handle)
    }

    async fn run(
        self,
        metrics: Arc<PipelineMetrics>,
        cancel: CancellationToken,
        status: &RwLock<PipelineStatus>,
        status_tx: broadcast::Sender<PipelineStatus>,
    ) -> Result<(), PipelineError> {
        let stats = Arc::new(SinkStats::default());
        let (sink_tx, sink_rx) = mpsc::channel::<SinkItem>(SINK_QUEUE_CAPACITY);
        let sink_handle = SinkWriterHandle::new(sink_tx.clone());

        // Sink writer task; a fatal sink error surfaces through the oneshot.
        let writer = SinkWriter::new(
            Arc::clone(&self.sink),
            self.config.sink_writer_config(),
            Arc::clone(&stats),
            Arc::clone(&metrics),
        );
        let (fatal_tx, mut fatal_rx) = oneshot::channel::<SinkError>();
        tokio::spawn(async move {
            if let Err(e) = writer.run(sink_rx).await {
                let _ = fatal_tx.send(e);
            }
        });

        // Dead letters flow straight into the sink queue, so the flush inside
        // a checkpoint covers them the same as emitted windows.
        let dead_letters = DeadLetterQueue::new(sink_tx.clone(), Arc::clone(&metrics));

        let (service, aggregator) = AggregatorService::new(
            self.config.aggregator_config(),
            self.enricher.clone(),
            Arc::clone(&metrics),
            sink_tx,
            dead_letters.clone(),
        );
        tokio::spawn(service.run());

        let source = RetryingSource::new(
            Arc::clone(&self.source),
            self.config.source_retry_config(),
            Arc::clone(&metrics),
        );

        let mut coordinator = CheckpointCoordinator::new(
            Arc::clone(&self.store),
            aggregator.clone(),
            sink_handle.clone(),
            Arc::clone(&metrics),
        );

        // Next offset to read per partition, mirrored into every checkpoint.
        let mut offsets: HashMap<u32, i64> = HashMap::new();
        if let Some(checkpoint) = coordinator.restore()? {
            aggregator
                .restore(checkpoint.aggregator)
                .await
                .map_err(PipelineError::Runtime)?;
            source.seek(&checkpoint.offsets).await?;
            offsets = checkpoint.offsets;
        }

        *status.write().await = PipelineStatus::Running;
        let _ = status_tx.send(PipelineStatus::Running);
        info!(instance = %self.config.instance_id, "pipeline running");

        let mut controller = PullRateController::new(self.config.backpressure_config());
        let checkpoint_by_time = self.config.checkpoint_interval_secs > 0;
        let mut checkpoint_interval =
            interval(Duration::from_secs(self.config.checkpoint_interval_secs.max(1)));
        checkpoint_interval.tick().await; // discard first tick, which is instantaneous
        let mut housekeeping = interval(Duration::from_millis(self.config.tick_interval_ms.max(1)));
        housekeeping.tick().await;

        let poll_timeout = Duration::from_millis(self.config.poll_timeout_ms);
        let mut records_since_checkpoint: u64 = 0;

        let outcome = loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!("Shutting down pipeline");
                    break Ok(());
                }

                fatal = &mut fatal_rx => {
                    break match fatal {
                        Ok(e) => {
                            error!("Sink writer failed, halting: {e}");
                            Err(PipelineError::Sink(e))
                        }
                        Err(_) => Err(PipelineError::Runtime(
                            "sink writer exited unexpectedly".to_string(),
                        )),
                    };
                }

                _ = checkpoint_interval.tick(), if checkpoint_by_time => {
                    if let Err(e) = take_checkpoint(&mut coordinator, &source, &offsets).await {
                        break Err(e);
                    }
                    records_since_checkpoint = 0;
                }

                _ = housekeeping.tick() => {
                    if aggregator.tick().await.is_err() {
                        break Err(PipelineError::Runtime("aggregator stopped".to_string()));
                    }
                    controller.tick(&stats);
                }

                polled = source.poll(controller.allowed_pull_rate(), poll_timeout) => match polled {
                    Ok(records) => {
                        if records.is_empty() {
                            continue;
                        }
                        incr_by(&metrics.records_polled, records.len() as u64);
                        records_since_checkpoint += records.len() as u64;

                        let mut events = Vec::with_capacity(records.len());
                        for record in &records {
                            offsets.insert(record.partition, record.offset + 1);
                            match normalize(record, &metrics) {
                                Ok(event) => events.push(event),
                                Err(dead) => dead_letters.publish(dead).await,
                            }
                        }
                        if aggregator.insert_batch(events).await.is_err() {
                            break Err(PipelineError::Runtime("aggregator stopped".to_string()));
                        }

                        if self.config.checkpoint_every_records > 0
                            && records_since_checkpoint >= self.config.checkpoint_every_records
                        {
                            debug!(
                                records = records_since_checkpoint,
                                "record-count checkpoint trigger"
                            );
                            if let Err(e) =
                                take_checkpoint(&mut coordinator, &source, &offsets).await
                            {
                                break Err(e);
                            }
                            records_since_checkpoint = 0;
                        }
                    }
                    Err(e) => {
                        error!("Source failed, halting: {e}");
                        break Err(PipelineError::Source(e));
                    }
                },
            }
        };

        *status.write().await = PipelineStatus::Stopping;
        let _ = status_tx.send(PipelineStatus::Stopping);

        // Best effort on every exit path: if the sink is the reason we are
        // stopping, the flush inside fails fast, the previous checkpoint
        // stays authoritative, and no offsets are committed past it.
        match coordinator.checkpoint(offsets.clone(), now_ms()).await {
            Ok(checkpoint) => {
                info!(id = checkpoint.id, "final checkpoint written");
                if let Err(e) = source.commit(&offsets).await {
                    warn!("Final offset commit failed: {e}");
                }
            }
            Err(e) => warn!("Final checkpoint skipped: {e}"),
        }
        let _ = aggregator.shutdown().await;

        outcome
    }
}

async fn take_checkpoint<S: RecordSource>(
    coordinator: &mut CheckpointCoordinator,
    source: &S,
    offsets: &HashMap<u32, i64>,
) -> Result<(), PipelineError> {
    coordinator.checkpoint(offsets.clone(), now_ms()).await?;
    source.commit(offsets).await?;
    Ok(())
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use dls_stream_processor::checkpoint::InMemoryCheckpointStore;
    use dls_stream_processor::sink::{DocumentStatus, SinkDocument};
    use dls_stream_processor::source::InMemorySource;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryBulkSink {
        documents: Mutex<HashMap<String, serde_json::Value>>,
    }

    impl MemoryBulkSink {
        fn document(&self, id: &str) -> Option<serde_json::Value> {
            self.documents.lock().unwrap().get(id).cloned()
        }
    }

    #[async_trait]
    impl BulkSink for MemoryBulkSink {
        async fn bulk_upsert(
            &self,
            documents: &[SinkDocument],
        ) -> Result<Vec<DocumentStatus>, SinkError> {
            let mut store = self.documents.lock().unwrap();
            for document in documents {
                store.insert(document.document_id.clone(), document.payload.clone());
            }
            Ok(documents.iter().map(|_| DocumentStatus::Indexed).collect())
        }
    }

    struct UnavailableSink;

    #[async_trait]
    impl BulkSink for UnavailableSink {
        async fn bulk_upsert(
            &self,
            _documents: &[SinkDocument],
        ) -> Result<Vec<DocumentStatus>, SinkError> {
            Err(SinkError::Transient("503 service unavailable".to_string()))
        }
    }

    fn fast_config() -> PipelineConfig {
        PipelineConfig {
            checkpoint_interval_secs: 0,
            checkpoint_every_records: 5,
            max_batch_wait_ms: 20,
            poll_timeout_ms: 10,
            tick_interval_ms: 20,
            ..Default::default()
        }
    }

    fn payload(time_ms: i64) -> Vec<u8> {
        json!({"timestamp_ms": time_ms, "source": "api", "level": "INFO"})
            .to_string()
            .into_bytes()
    }

    #[tokio::test]
    async fn test_pipeline_processes_and_checkpoints() {
        let source = InMemorySource::new();
        for time in [5_000, 30_000, 58_000, 65_000, 80_000] {
            source.push(0, b"k", &payload(time), time);
        }
        let sink = Arc::new(MemoryBulkSink::default());
        let pipeline = Pipeline::new(
            fast_config(),
            Arc::new(source.clone()),
            Arc::clone(&sink) as Arc<dyn BulkSink>,
            Arc::new(InMemoryCheckpointStore::default()),
        )
        .unwrap();

        let handle = pipeline.start().await.unwrap();
        assert!(handle.is_running().await);

        // The 80s event closes [0, 60s); give the batch timer a moment.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let doc = sink
            .document("window-api-0-60000")
            .expect("window indexed");
        assert_eq!(doc["count"], 3);

        handle.stop().await.unwrap();
        handle.wait_stopped().await;
        assert!(!handle.is_running().await);

        // Five records triggered the record-count checkpoint, which commits.
        assert_eq!(source.committed_offsets()[&0], 5);
        assert_eq!(handle.metrics().snapshot().records_polled, 5);
        assert!(handle.metrics().snapshot().checkpoints_taken >= 1);
    }

    #[tokio::test]
    async fn test_start_returns_once_running() {
        let pipeline = Pipeline::new(
            fast_config(),
            Arc::new(InMemorySource::new()),
            Arc::new(MemoryBulkSink::default()),
            Arc::new(InMemoryCheckpointStore::default()),
        )
        .unwrap();

        // start() waits on the status broadcast, so by the time it returns
        // the run task has already left Starting.
        let handle = pipeline.start().await.unwrap();
        assert_eq!(handle.status().await, PipelineStatus::Running);

        handle.stop().await.unwrap();
        handle.wait_stopped().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let pipeline = Pipeline::new(
            fast_config(),
            Arc::new(InMemorySource::new()),
            Arc::new(MemoryBulkSink::default()),
            Arc::new(InMemoryCheckpointStore::default()),
        )
        .unwrap();

        let handle = pipeline.start().await.unwrap();
        handle.stop().await.unwrap();
        handle.stop().await.unwrap();
        handle.wait_stopped().await;
        assert_eq!(handle.status().await, PipelineStatus::Stopped);
    }

    #[tokio::test]
    async fn test_unavailable_sink_halts_pipeline() {
        let source = InMemorySource::new();
        for time in [5_000, 100_000] {
            source.push(0, b"k", &payload(time), time);
        }
        let config = PipelineConfig {
            retry_max_attempts: 1,
            ..fast_config()
        };
        let pipeline = Pipeline::new(
            config,
            Arc::new(source.clone()),
            Arc::new(UnavailableSink),
            Arc::new(InMemoryCheckpointStore::default()),
        )
        .unwrap();

        let handle = pipeline.start().await.unwrap();
        handle.wait_stopped().await;

        // Halted on its own; no offsets were committed past the failure.
        assert!(source.committed_offsets().is_empty());
    }

    #[tokio::test]
    async fn test_restores_from_checkpoint_on_start() {
        let store = Arc::new(InMemoryCheckpointStore::default());
        let source = InMemorySource::new();
        for time in [5_000, 30_000] {
            source.push(0, b"k", &payload(time), time);
        }
        let sink = Arc::new(MemoryBulkSink::default());

        // First run checkpoints (2 records) and stops cleanly.
        let config = PipelineConfig {
            checkpoint_every_records: 2,
            ..fast_config()
        };
        let pipeline = Pipeline::new(
            config.clone(),
            Arc::new(source.clone()),
            Arc::clone(&sink) as Arc<dyn BulkSink>,
            Arc::clone(&store) as Arc<dyn CheckpointStore>,
        )
        .unwrap();
        let handle = pipeline.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.stop().await.unwrap();
        handle.wait_stopped().await;

        // Second run resumes behind the new records and closes the window.
        for time in [58_000, 80_000] {
            source.push(0, b"k", &payload(time), time);
        }
        let pipeline = Pipeline::new(
            config,
            Arc::new(source.clone()),
            Arc::clone(&sink) as Arc<dyn BulkSink>,
            store,
        )
        .unwrap();
        let handle = pipeline.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let doc = sink
            .document("window-api-0-60000")
            .expect("window closed after resume");
        assert_eq!(doc["count"], 3, "pre-checkpoint events survived the restart");

        handle.stop().await.unwrap();
        handle.wait_stopped().await;
    }
}
