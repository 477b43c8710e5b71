// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Checkpointing: atomic snapshots of source offsets plus aggregator state.
//!
//! A checkpoint is durable only when the whole blob (offsets and aggregate
//! snapshot together) lands atomically; a crash mid-write leaves the previous
//! checkpoint intact. The coordinator quiesces the sink before snapshotting,
//! so a checkpoint never advances past a batch the backend has not
//! acknowledged. On restore, the source seeks back to the checkpointed
//! offsets and duplicates are bounded by one checkpoint interval; idempotent
//! document ids turn that at-least-once replay into exactly-once effects.

use crate::aggregator::AggregatorSnapshot;
use crate::aggregator_service::AggregatorHandle;
use crate::metrics::{incr, PipelineMetrics};
use crate::sink::{SinkError, SinkWriterHandle};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint io error: {0}")]
    Io(#[from] std::io::Error),

    /// The stored blob failed to deserialize. Fatal: resuming from an
    /// unknown position risks silent data loss.
    #[error("checkpoint store corrupt: {0}")]
    Corrupt(String),

    #[error("sink refused to quiesce: {0}")]
    SinkNotQuiesced(#[from] SinkError),

    #[error("aggregator unavailable: {0}")]
    Aggregator(String),
}

/// Immutable snapshot of processing progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: u64,
    /// Next offset to read, per partition.
    pub offsets: HashMap<u32, i64>,
    pub aggregator: AggregatorSnapshot,
    pub created_at_ms: i64,
}

/// Single-writer persistence for the latest checkpoint, keyed by pipeline
/// instance. `save` must be all-or-nothing.
pub trait CheckpointStore: Send + Sync {
    fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;
    fn load(&self) -> Result<Option<Checkpoint>, CheckpointError>;
}

/// Filesystem-backed store: serialize to a temp file in the same directory,
/// then atomically rename over the live file. The rename both publishes the
/// new checkpoint and garbage-collects the superseded one.
pub struct FileCheckpointStore {
    dir: PathBuf,
    instance_id: String,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>, instance_id: impl Into<String>) -> Self {
        FileCheckpointStore {
            dir: dir.into(),
            instance_id: instance_id.into(),
        }
    }

    fn path(&self) -> PathBuf {
        self.dir.join(format!("{}.ckpt", self.instance_id))
    }

    fn tmp_path(&self) -> PathBuf {
        self.dir.join(format!("{}.ckpt.tmp", self.instance_id))
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        fs::create_dir_all(&self.dir)?;
        let blob = serde_json::to_vec(checkpoint)
            .map_err(|e| CheckpointError::Corrupt(format!("serialize failed: {e}")))?;
        let tmp = self.tmp_path();
        fs::write(&tmp, blob)?;
        fs::rename(&tmp, self.path())?;
        debug!(id = checkpoint.id, "checkpoint persisted");
        Ok(())
    }

    fn load(&self) -> Result<Option<Checkpoint>, CheckpointError> {
        let path = self.path();
        let blob = match fs::read(&path) {
            Ok(blob) => blob,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let checkpoint = serde_json::from_slice(&blob)
            .map_err(|e| CheckpointError::Corrupt(format!("{}: {e}", path.display())))?;
        Ok(Some(checkpoint))
    }
}

/// Test double holding the latest checkpoint in memory.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    slot: Mutex<Option<Checkpoint>>,
}

impl CheckpointStore for InMemoryCheckpointStore {
    fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        #[allow(clippy::unwrap_used)]
        let mut slot = self.slot.lock().unwrap();
        *slot = Some(checkpoint.clone());
        Ok(())
    }

    fn load(&self) -> Result<Option<Checkpoint>, CheckpointError> {
        #[allow(clippy::unwrap_used)]
        let slot = self.slot.lock().unwrap();
        Ok(slot.clone())
    }
}

/// Orchestrates checkpoint capture and restore against the aggregator
/// service, the sink writer, and the store. Cadence (interval or processed
/// record count) is driven by the pipeline loop.
pub struct CheckpointCoordinator {
    store: Arc<dyn CheckpointStore>,
    aggregator: AggregatorHandle,
    sink: SinkWriterHandle,
    metrics: Arc<PipelineMetrics>,
    next_id: u64,
}

impl CheckpointCoordinator {
    pub fn new(
        store: Arc<dyn CheckpointStore>,
        aggregator: AggregatorHandle,
        sink: SinkWriterHandle,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        CheckpointCoordinator {
            store,
            aggregator,
            sink,
            metrics,
            next_id: 1,
        }
    }

    /// Load the latest durable checkpoint, if any, and prime the id counter.
    /// The caller seeks the source and restores the aggregator from it.
    pub fn restore(&mut self) -> Result<Option<Checkpoint>, CheckpointError> {
        let loaded = self.store.load()?;
        if let Some(ref checkpoint) = loaded {
            self.next_id = checkpoint.id + 1;
            info!(
                id = checkpoint.id,
                partitions = checkpoint.offsets.len(),
                windows = checkpoint.aggregator.windows.len(),
                "restoring from checkpoint"
            );
        } else {
            debug!("no checkpoint found, starting fresh");
        }
        Ok(loaded)
    }

    /// Capture and persist a consistent snapshot.
    ///
    /// Order matters: the aggregator snapshot command serializes behind any
    /// queued inserts, so when it returns, every window those inserts closed
    /// has already been handed to the sink queue. Flushing the sink after
    /// that therefore acknowledges everything the snapshot no longer
    /// contains; only then is the blob saved. A window is thus always either
    /// acked by the backend or inside the snapshot, never in neither. Dead
    /// letters enter the same sink channel, so the flush covers them too.
    /// The caller must not feed the aggregator concurrently.
    pub async fn checkpoint(
        &mut self,
        offsets: HashMap<u32, i64>,
        now_ms: i64,
    ) -> Result<Checkpoint, CheckpointError> {
        let snapshot = self
            .aggregator
            .snapshot()
            .await
            .map_err(CheckpointError::Aggregator)?;

        self.sink.flush().await?;

        let checkpoint = Checkpoint {
            id: self.next_id,
            offsets,
            aggregator: snapshot,
            created_at_ms: now_ms,
        };
        self.store.save(&checkpoint)?;
        self.next_id += 1;
        incr(&self.metrics.checkpoints_taken);
        info!(id = checkpoint.id, "checkpoint complete");
        Ok(checkpoint)
    }
}
