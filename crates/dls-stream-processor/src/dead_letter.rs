// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Dead-letter side output.
//!
//! Everything diverted from the main pipeline (malformed records, late events
//! under the drop policy) goes through here so it is observable rather than
//! silently discarded. Dead letters enter the sink writer's input channel
//! directly: a sink `Flush` observed after a publish therefore covers the
//! dead letter too, which is what lets a checkpoint commit offsets past the
//! diverted record. Each publish increments the dead-letter counter; the
//! writer indexes the entry under a `deadletter-` document id prefix.

use crate::metrics::{incr, PipelineMetrics};
use crate::record::DeadLetter;
use crate::sink::SinkItem;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Cloneable producer side of the dead-letter path.
#[derive(Clone)]
pub struct DeadLetterQueue {
    tx: mpsc::Sender<SinkItem>,
    metrics: Arc<PipelineMetrics>,
}

impl DeadLetterQueue {
    pub fn new(tx: mpsc::Sender<SinkItem>, metrics: Arc<PipelineMetrics>) -> Self {
        DeadLetterQueue { tx, metrics }
    }

    pub async fn publish(&self, dead: DeadLetter) {
        incr(&self.metrics.dead_letters);
        debug!(
            partition = dead.partition,
            offset = dead.offset,
            reason = %dead.reason,
            "dead-lettering record"
        );
        if self.tx.send(SinkItem::DeadLetter(dead)).await.is_err() {
            // Writer gone during shutdown; the counter above already
            // recorded the event.
            warn!("sink writer dropped, dead letter not indexed");
        }
    }
}
