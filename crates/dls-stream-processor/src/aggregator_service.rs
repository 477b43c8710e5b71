// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Actor wrapper around [`WindowedAggregator`].
//!
//! All aggregation state lives in one task; commands are serialized over a
//! bounded channel, so snapshots never observe torn state and the accumulator
//! map needs no locks. Emitted results flow into the bounded sink queue: when
//! the sink falls behind, that queue fills and this task suspends, the
//! command channel fills behind it, and [`AggregatorHandle::insert_batch`]
//! suspends the poll loop in turn. That chain is the backpressure path.

use crate::aggregator::{AggregatorConfig, AggregatorSnapshot, Enricher, WindowedAggregator};
use crate::dead_letter::DeadLetterQueue;
use crate::metrics::PipelineMetrics;
use crate::record::{AggregateResult, LogEvent};
use crate::sink::SinkItem;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

/// Commands queued ahead of a stalled sink are bounded by this.
const COMMAND_QUEUE_CAPACITY: usize = 64;

#[derive(Debug)]
pub enum AggregatorCommand {
    InsertBatch(Vec<LogEvent>),
    /// Re-run the emission scan without new input.
    Tick,
    Snapshot(oneshot::Sender<AggregatorSnapshot>),
    Restore(AggregatorSnapshot, oneshot::Sender<()>),
    Shutdown,
}

#[derive(Clone)]
pub struct AggregatorHandle {
    tx: mpsc::Sender<AggregatorCommand>,
}

impl AggregatorHandle {
    /// Queue a batch for aggregation. Suspends while the command channel is
    /// full, which is how a sink stall reaches the poll loop.
    pub async fn insert_batch(
        &self,
        events: Vec<LogEvent>,
    ) -> Result<(), mpsc::error::SendError<AggregatorCommand>> {
        self.tx.send(AggregatorCommand::InsertBatch(events)).await
    }

    pub async fn tick(&self) -> Result<(), mpsc::error::SendError<AggregatorCommand>> {
        self.tx.send(AggregatorCommand::Tick).await
    }

    pub async fn snapshot(&self) -> Result<AggregatorSnapshot, String> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(AggregatorCommand::Snapshot(response_tx))
            .await
            .map_err(|e| format!("Failed to send snapshot command: {}", e))?;

        response_rx
            .await
            .map_err(|e| format!("Failed to receive snapshot response: {}", e))
    }

    pub async fn restore(&self, snapshot: AggregatorSnapshot) -> Result<(), String> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(AggregatorCommand::Restore(snapshot, response_tx))
            .await
            .map_err(|e| format!("Failed to send restore command: {}", e))?;

        response_rx
            .await
            .map_err(|e| format!("Failed to receive restore ack: {}", e))
    }

    pub async fn shutdown(&self) -> Result<(), mpsc::error::SendError<AggregatorCommand>> {
        self.tx.send(AggregatorCommand::Shutdown).await
    }
}

pub struct AggregatorService {
    aggregator: WindowedAggregator,
    rx: mpsc::Receiver<AggregatorCommand>,
    sink_tx: mpsc::Sender<SinkItem>,
    dead_letters: DeadLetterQueue,
}

impl AggregatorService {
    pub fn new(
        config: AggregatorConfig,
        enricher: Option<Arc<dyn Enricher>>,
        metrics: Arc<PipelineMetrics>,
        sink_tx: mpsc::Sender<SinkItem>,
        dead_letters: DeadLetterQueue,
    ) -> (Self, AggregatorHandle) {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let aggregator = WindowedAggregator::new(config, enricher, metrics);

        let service = Self {
            aggregator,
            rx,
            sink_tx,
            dead_letters,
        };

        let handle = AggregatorHandle { tx };

        (service, handle)
    }

    pub async fn run(mut self) {
        debug!("Aggregator service started");

        while let Some(command) = self.rx.recv().await {
            match command {
                AggregatorCommand::InsertBatch(events) => {
                    for event in events {
                        let processed = self.aggregator.process(&event);
                        if let Some(dead) = processed.late {
                            self.dead_letters.publish(dead).await;
                        }
                        self.emit(processed.emitted).await;
                    }
                }

                AggregatorCommand::Tick => {
                    let results = self.aggregator.tick();
                    self.emit(results).await;
                }

                AggregatorCommand::Snapshot(response_tx) => {
                    let snapshot = self.aggregator.snapshot();
                    if response_tx.send(snapshot).is_err() {
                        error!("Failed to send snapshot response - receiver dropped");
                    }
                }

                AggregatorCommand::Restore(snapshot, response_tx) => {
                    self.aggregator.restore(snapshot);
                    if response_tx.send(()).is_err() {
                        error!("Failed to send restore ack - receiver dropped");
                    }
                }

                AggregatorCommand::Shutdown => {
                    debug!("Aggregator service shutting down");
                    break;
                }
            }
        }

        debug!("Aggregator service stopped");
    }

    /// Forward closed windows to the sink queue. Blocks when the queue is
    /// full; that suspension is the backpressure path.
    async fn emit(&self, results: Vec<AggregateResult>) {
        for result in results {
            if self.sink_tx.send(SinkItem::Result(result)).await.is_err() {
                error!("Sink queue closed, dropping emitted window");
            }
        }
    }
}
