// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Data model shared across the pipeline stages.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// A raw record as read from one partition of the source log. Immutable once
/// polled; ownership passes to the normalizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub partition: u32,
    pub offset: i64,
    pub key: Vec<u8>,
    pub payload: Vec<u8>,
    /// Wall-clock time the record was received, unix millis.
    pub received_at_ms: i64,
}

/// Log severity carried by normalized events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    pub const ALL: [LogLevel; 5] = [
        LogLevel::Debug,
        LogLevel::Info,
        LogLevel::Warn,
        LogLevel::Error,
        LogLevel::Fatal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Fatal => "FATAL",
        }
    }

    fn index(&self) -> usize {
        match self {
            LogLevel::Debug => 0,
            LogLevel::Info => 1,
            LogLevel::Warn => 2,
            LogLevel::Error => 3,
            LogLevel::Fatal => 4,
        }
    }
}

impl FromStr for LogLevel {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARN" | "WARNING" => Ok(LogLevel::Warn),
            "ERROR" => Ok(LogLevel::Error),
            "FATAL" | "CRITICAL" => Ok(LogLevel::Fatal),
            _ => Err(()),
        }
    }
}

/// A structured event produced by the normalizer.
///
/// `event_time_ms` may be earlier than processing time (out-of-order arrival)
/// but is never absent: a missing or unparseable timestamp falls back to
/// `received_at_ms` and the event carries `synthetic_time = true`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    pub event_time_ms: i64,
    pub source: String,
    pub level: LogLevel,
    pub fields: serde_json::Map<String, serde_json::Value>,
    pub partition: u32,
    pub offset: i64,
    pub synthetic_time: bool,
}

/// Identifies one aggregation bucket: a grouping key and a fixed-size,
/// non-overlapping, right-open interval `[window_start_ms, window_end_ms)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowKey {
    pub grouping_key: String,
    pub window_start_ms: i64,
    pub window_end_ms: i64,
}

impl WindowKey {
    pub fn for_event(grouping_key: &str, event_time_ms: i64, window_size_ms: i64) -> Self {
        let window_start_ms = window_start(event_time_ms, window_size_ms);
        WindowKey {
            grouping_key: grouping_key.to_string(),
            window_start_ms,
            window_end_ms: window_start_ms + window_size_ms,
        }
    }

    /// Deterministic document id so replayed emissions overwrite rather than
    /// duplicate in the index.
    pub fn document_id(&self) -> String {
        format!(
            "window-{}-{}-{}",
            self.grouping_key, self.window_start_ms, self.window_end_ms
        )
    }
}

/// Floor of `event_time_ms` to the window grid. Handles negative timestamps
/// (floor division, not truncation toward zero).
pub fn window_start(event_time_ms: i64, window_size_ms: i64) -> i64 {
    event_time_ms.div_euclid(window_size_ms) * window_size_ms
}

/// Mutable accumulator for one window. Owned exclusively by the aggregator;
/// serialized as part of checkpoint snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowAccumulator {
    pub count: u64,
    /// Counts indexed by [`LogLevel::ALL`] order.
    pub level_counts: [u64; 5],
    pub synthetic_time_count: u64,
    pub min_event_time_ms: Option<i64>,
    pub max_event_time_ms: Option<i64>,
}

impl WindowAccumulator {
    pub fn observe(&mut self, event: &LogEvent) {
        self.count += 1;
        self.level_counts[event.level.index()] += 1;
        if event.synthetic_time {
            self.synthetic_time_count += 1;
        }
        self.min_event_time_ms = Some(match self.min_event_time_ms {
            Some(t) => t.min(event.event_time_ms),
            None => event.event_time_ms,
        });
        self.max_event_time_ms = Some(match self.max_event_time_ms {
            Some(t) => t.max(event.event_time_ms),
            None => event.event_time_ms,
        });
    }

    /// Fold another accumulator into this one (late-event corrections).
    pub fn merge(&mut self, other: &WindowAccumulator) {
        self.count += other.count;
        for (slot, add) in self.level_counts.iter_mut().zip(other.level_counts) {
            *slot += add;
        }
        self.synthetic_time_count += other.synthetic_time_count;
        self.min_event_time_ms = match (self.min_event_time_ms, other.min_event_time_ms) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.max_event_time_ms = match (self.max_event_time_ms, other.max_event_time_ms) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }

    pub fn level_count(&self, level: LogLevel) -> u64 {
        self.level_counts[level.index()]
    }
}

/// A closed (or corrected) window emitted by the aggregator toward the sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateResult {
    pub key: WindowKey,
    pub accumulator: WindowAccumulator,
    /// Side metadata joined at emission time, if the enricher succeeded.
    pub enrichment: Option<serde_json::Map<String, serde_json::Value>>,
    /// Set when an enrichment lookup failed; emission is never blocked on it.
    pub enrichment_incomplete: bool,
    /// Set when this result re-emits an already-closed window after a late
    /// merge (only under the merge-and-correct late policy).
    pub correction: bool,
}

impl AggregateResult {
    pub fn document_id(&self) -> String {
        self.key.document_id()
    }
}

/// A record diverted from the main pipeline: malformed input, a late event
/// under the drop policy, or a document the sink rejected. Retained for
/// inspection rather than discarded silently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub partition: u32,
    pub offset: i64,
    pub payload: Vec<u8>,
    pub reason: String,
}

impl DeadLetter {
    pub fn from_record(record: &RawRecord, reason: impl Into<String>) -> Self {
        DeadLetter {
            partition: record.partition,
            offset: record.offset,
            payload: record.payload.clone(),
            reason: reason.into(),
        }
    }

    pub fn document_id(&self) -> String {
        format!("deadletter-{}-{}", self.partition, self.offset)
    }
}
