// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Record normalizer: raw bytes in, structured [`LogEvent`] out.
//!
//! Pure classification, no side effects beyond counter increments. Malformed
//! payloads become dead letters; the pipeline never fails on bad input.

use crate::metrics::{incr, PipelineMetrics};
use crate::record::{DeadLetter, LogEvent, LogLevel, RawRecord};
use serde_json::Value;

/// Payload keys consumed by normalization; everything else passes through
/// into `fields`.
const KEY_SOURCE: &str = "source";
const KEY_LEVEL: &str = "level";
const KEY_TIMESTAMP: &str = "timestamp_ms";

/// Parse and validate one raw record.
///
/// Required fields: `source` (non-empty string) and `level` (known severity).
/// `timestamp_ms` is optional: when missing or unparseable the event falls
/// back to the record's receive time and is flagged `synthetic_time`.
pub fn normalize(record: &RawRecord, metrics: &PipelineMetrics) -> Result<LogEvent, DeadLetter> {
    match try_normalize(record) {
        Ok(event) => {
            incr(&metrics.events_normalized);
            Ok(event)
        }
        Err(reason) => {
            incr(&metrics.normalize_failures);
            Err(DeadLetter::from_record(record, reason))
        }
    }
}

fn try_normalize(record: &RawRecord) -> Result<LogEvent, String> {
    let value: Value = serde_json::from_slice(&record.payload)
        .map_err(|e| format!("payload is not valid JSON: {e}"))?;
    let Value::Object(mut fields) = value else {
        return Err("payload is not a JSON object".to_string());
    };

    let source = match fields.remove(KEY_SOURCE) {
        Some(Value::String(s)) if !s.trim().is_empty() => s,
        Some(_) => return Err("field 'source' is not a string".to_string()),
        None => return Err("missing required field 'source'".to_string()),
    };

    let level = match fields.remove(KEY_LEVEL) {
        Some(Value::String(s)) => s
            .parse::<LogLevel>()
            .map_err(|()| format!("unknown log level '{s}'"))?,
        Some(_) => return Err("field 'level' is not a string".to_string()),
        None => return Err("missing required field 'level'".to_string()),
    };

    let (event_time_ms, synthetic_time) = match fields.remove(KEY_TIMESTAMP) {
        Some(Value::Number(n)) => match n.as_i64() {
            Some(ms) => (ms, false),
            None => (record.received_at_ms, true),
        },
        Some(_) | None => (record.received_at_ms, true),
    };

    Ok(LogEvent {
        event_time_ms,
        source,
        level,
        fields,
        partition: record.partition,
        offset: record.offset,
        synthetic_time,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn record(payload: &str) -> RawRecord {
        RawRecord {
            partition: 2,
            offset: 41,
            key: b"host-a".to_vec(),
            payload: payload.as_bytes().to_vec(),
            received_at_ms: 123_456,
        }
    }

    fn metrics() -> Arc<PipelineMetrics> {
        Arc::new(PipelineMetrics::default())
    }

    #[test]
    fn test_normalize_full_event() {
        let m = metrics();
        let event = normalize(
            &record(r#"{"source":"api","level":"error","timestamp_ms":9000,"route":"/v1"}"#),
            &m,
        )
        .expect("should normalize");

        assert_eq!(event.source, "api");
        assert_eq!(event.level, LogLevel::Error);
        assert_eq!(event.event_time_ms, 9_000);
        assert!(!event.synthetic_time);
        assert_eq!(event.partition, 2);
        assert_eq!(event.offset, 41);
        assert_eq!(event.fields["route"], "/v1");
        assert_eq!(m.snapshot().events_normalized, 1);
    }

    #[test]
    fn test_missing_timestamp_uses_receive_time() {
        let event = normalize(&record(r#"{"source":"api","level":"info"}"#), &metrics())
            .expect("should normalize");
        assert_eq!(event.event_time_ms, 123_456);
        assert!(event.synthetic_time);
    }

    #[test]
    fn test_non_numeric_timestamp_is_synthetic() {
        let event = normalize(
            &record(r#"{"source":"api","level":"info","timestamp_ms":"yesterday"}"#),
            &metrics(),
        )
        .expect("should normalize");
        assert!(event.synthetic_time);
        assert_eq!(event.event_time_ms, 123_456);
    }

    #[test]
    fn test_malformed_json_is_dead_lettered() {
        let m = metrics();
        let dead = normalize(&record("not json"), &m).unwrap_err();
        assert_eq!(dead.partition, 2);
        assert_eq!(dead.offset, 41);
        assert!(dead.reason.contains("not valid JSON"));
        assert_eq!(m.snapshot().normalize_failures, 1);
    }

    #[test]
    fn test_missing_source_is_dead_lettered() {
        let dead = normalize(&record(r#"{"level":"info"}"#), &metrics()).unwrap_err();
        assert!(dead.reason.contains("source"));
    }

    #[test]
    fn test_unknown_level_is_dead_lettered() {
        let dead = normalize(
            &record(r#"{"source":"api","level":"shout"}"#),
            &metrics(),
        )
        .unwrap_err();
        assert!(dead.reason.contains("unknown log level"));
    }

    #[test]
    fn test_dead_letter_document_id_is_stable() {
        let dead = normalize(&record("{}"), &metrics()).unwrap_err();
        assert_eq!(dead.document_id(), "deadletter-2-41");
    }
}
