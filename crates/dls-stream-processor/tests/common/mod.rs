// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Common test utilities and mocks for integration tests

use async_trait::async_trait;
use dls_stream_processor::sink::{BulkSink, DocumentStatus, SinkDocument, SinkError};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// In-memory search backend keyed by document id, so replayed upserts
/// overwrite instead of duplicating, the same way the real index behaves.
#[derive(Default)]
pub struct MemorySink {
    documents: Mutex<HashMap<String, serde_json::Value>>,
    /// Lifetime upsert count per document id, to observe replays.
    upsert_counts: Mutex<HashMap<String, usize>>,
    bulk_calls: AtomicUsize,
}

impl MemorySink {
    pub fn document(&self, id: &str) -> Option<serde_json::Value> {
        self.documents.lock().unwrap().get(id).cloned()
    }

    pub fn document_count(&self) -> usize {
        self.documents.lock().unwrap().len()
    }

    pub fn upserts_for(&self, id: &str) -> usize {
        *self.upsert_counts.lock().unwrap().get(id).unwrap_or(&0)
    }

    pub fn bulk_calls(&self) -> usize {
        self.bulk_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BulkSink for MemorySink {
    async fn bulk_upsert(
        &self,
        documents: &[SinkDocument],
    ) -> Result<Vec<DocumentStatus>, SinkError> {
        self.bulk_calls.fetch_add(1, Ordering::SeqCst);
        let mut store = self.documents.lock().unwrap();
        let mut counts = self.upsert_counts.lock().unwrap();
        for document in documents {
            store.insert(document.document_id.clone(), document.payload.clone());
            *counts.entry(document.document_id.clone()).or_insert(0) += 1;
        }
        Ok(documents.iter().map(|_| DocumentStatus::Indexed).collect())
    }
}

/// Fails the first `failures` bulk calls with a transient error, then
/// delegates to the inner sink.
pub struct FlakySink {
    inner: Arc<MemorySink>,
    failures_left: AtomicUsize,
}

impl FlakySink {
    pub fn new(inner: Arc<MemorySink>, failures: usize) -> Self {
        FlakySink {
            inner,
            failures_left: AtomicUsize::new(failures),
        }
    }
}

#[async_trait]
impl BulkSink for FlakySink {
    async fn bulk_upsert(
        &self,
        documents: &[SinkDocument],
    ) -> Result<Vec<DocumentStatus>, SinkError> {
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(SinkError::Transient("503 service unavailable".to_string()));
        }
        self.inner.bulk_upsert(documents).await
    }
}

/// Serialized broker payload the normalizer accepts.
pub fn log_payload(source: &str, level: &str, timestamp_ms: i64) -> Vec<u8> {
    json!({
        "timestamp_ms": timestamp_ms,
        "source": source,
        "level": level,
        "message": format!("event at {timestamp_ms}"),
    })
    .to_string()
    .into_bytes()
}
