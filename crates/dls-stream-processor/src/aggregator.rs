// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Windowed aggregation with watermark-driven emission.
//!
//! Events are bucketed by `(source, fixed window)`. Each partition carries a
//! monotonic watermark (max observed event time minus the out-of-order
//! slack); the global watermark is the minimum across partitions, so a
//! stalled partition holds back emission for all keys. A window is emitted
//! and evicted once `window_end + allowed_lateness <= global watermark`.
//! Closed windows emit in non-decreasing `window_end` order.

use crate::metrics::{incr, PipelineMetrics};
use crate::record::{AggregateResult, DeadLetter, LogEvent, WindowAccumulator, WindowKey};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// What to do with an event that arrives behind the lateness horizon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LatePolicy {
    /// Route to the dead-letter output and count it. Default.
    Drop,
    /// Merge into the already-closed aggregate and re-emit a correction.
    MergeAndCorrect,
}

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub window_size_ms: i64,
    pub allowed_lateness_ms: i64,
    /// Watermark lag behind the max observed event time.
    pub out_of_order_slack_ms: i64,
    pub late_policy: LatePolicy,
    /// How long closed accumulators are retained for late-merge corrections
    /// (measured against the watermark). Only relevant under
    /// [`LatePolicy::MergeAndCorrect`].
    pub correction_retention_ms: i64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        AggregatorConfig {
            window_size_ms: 60_000,
            allowed_lateness_ms: 10_000,
            out_of_order_slack_ms: 0,
            late_policy: LatePolicy::Drop,
            correction_retention_ms: 300_000,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("enrichment lookup failed: {0}")]
pub struct EnrichError(pub String);

/// Side-metadata join applied at emission time. Must be idempotent and
/// side-effect-free on failure: a failed lookup flags the result
/// `enrichment_incomplete` and never blocks emission.
pub trait Enricher: Send + Sync {
    fn enrich(
        &self,
        key: &WindowKey,
    ) -> Result<serde_json::Map<String, serde_json::Value>, EnrichError>;
}

/// Outcome of processing one event.
#[derive(Debug, Default)]
pub struct Processed {
    /// Windows closed by the watermark advance this event caused, plus any
    /// late-merge correction.
    pub emitted: Vec<AggregateResult>,
    /// Set when the event was classified late under the drop policy.
    pub late: Option<DeadLetter>,
}

/// Serialized aggregator state carried inside a checkpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregatorSnapshot {
    pub windows: Vec<(WindowKey, WindowAccumulator)>,
    /// Closed-window accumulators retained for late-merge corrections.
    pub emitted: Vec<(WindowKey, WindowAccumulator)>,
    pub watermarks: HashMap<u32, i64>,
}

pub struct WindowedAggregator {
    config: AggregatorConfig,
    open: hashbrown::HashMap<WindowKey, WindowAccumulator>,
    /// Only populated under [`LatePolicy::MergeAndCorrect`]; entries are
    /// dropped once the watermark passes `window_end + correction_retention`.
    emitted: hashbrown::HashMap<WindowKey, WindowAccumulator>,
    watermarks: HashMap<u32, i64>,
    enricher: Option<Arc<dyn Enricher>>,
    metrics: Arc<PipelineMetrics>,
}

impl WindowedAggregator {
    pub fn new(
        config: AggregatorConfig,
        enricher: Option<Arc<dyn Enricher>>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        WindowedAggregator {
            config,
            open: hashbrown::HashMap::new(),
            emitted: hashbrown::HashMap::new(),
            watermarks: HashMap::new(),
            enricher,
            metrics,
        }
    }

    /// Minimum watermark across all tracked partitions. `None` until the
    /// first event arrives.
    pub fn global_watermark(&self) -> Option<i64> {
        self.watermarks.values().copied().min()
    }

    pub fn open_window_count(&self) -> usize {
        self.open.len()
    }

    pub fn process(&mut self, event: &LogEvent) -> Processed {
        let mut out = Processed::default();

        let late_horizon = self
            .global_watermark()
            .map(|w| w - self.config.allowed_lateness_ms);
        let is_late = late_horizon.is_some_and(|h| event.event_time_ms < h);

        if is_late {
            incr(&self.metrics.late_events);
            match self.config.late_policy {
                LatePolicy::Drop => {
                    out.late = Some(late_dead_letter(event, late_horizon.unwrap_or(i64::MIN)));
                }
                LatePolicy::MergeAndCorrect => match self.merge_late(event) {
                    LateMerge::Correction(correction) => out.emitted.push(correction),
                    LateMerge::Absorbed => {}
                    LateMerge::NoState => {
                        out.late = Some(late_dead_letter(event, late_horizon.unwrap_or(i64::MIN)));
                    }
                },
            }
        } else {
            let key =
                WindowKey::for_event(&event.source, event.event_time_ms, self.config.window_size_ms);
            self.open.entry(key).or_default().observe(event);
        }

        self.advance_watermark(event.partition, event.event_time_ms);
        out.emitted.extend(self.close_due_windows());
        out
    }

    /// Re-run the emission scan without new input, used after a restore.
    /// Watermarks are untouched: an idle partition holds, never regresses.
    pub fn tick(&mut self) -> Vec<AggregateResult> {
        self.close_due_windows()
    }

    pub fn snapshot(&self) -> AggregatorSnapshot {
        AggregatorSnapshot {
            windows: self
                .open
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            emitted: self
                .emitted
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            watermarks: self.watermarks.clone(),
        }
    }

    pub fn restore(&mut self, snapshot: AggregatorSnapshot) {
        self.open = snapshot.windows.into_iter().collect();
        self.emitted = snapshot.emitted.into_iter().collect();
        self.watermarks = snapshot.watermarks;
    }

    fn advance_watermark(&mut self, partition: u32, event_time_ms: i64) {
        let candidate = event_time_ms - self.config.out_of_order_slack_ms;
        let entry = self.watermarks.entry(partition).or_insert(candidate);
        if candidate > *entry {
            *entry = candidate;
        }
    }

    /// Merge a late event into its window. A still-open window absorbs the
    /// event silently; a closed one rebuilds and re-emits a correction; past
    /// the retention horizon there is nothing left to merge into.
    fn merge_late(&mut self, event: &LogEvent) -> LateMerge {
        let key =
            WindowKey::for_event(&event.source, event.event_time_ms, self.config.window_size_ms);

        if let Some(acc) = self.open.get_mut(&key) {
            acc.observe(event);
            return LateMerge::Absorbed;
        }

        let Some(acc) = self.emitted.get_mut(&key) else {
            return LateMerge::NoState;
        };
        acc.observe(event);
        let merged = acc.clone();
        incr(&self.metrics.corrections_emitted);
        LateMerge::Correction(self.build_result(key, merged, true))
    }

    fn close_due_windows(&mut self) -> Vec<AggregateResult> {
        let Some(watermark) = self.global_watermark() else {
            return Vec::new();
        };

        let mut due: Vec<WindowKey> = self
            .open
            .keys()
            .filter(|k| k.window_end_ms + self.config.allowed_lateness_ms <= watermark)
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            (a.window_end_ms, &a.grouping_key).cmp(&(b.window_end_ms, &b.grouping_key))
        });

        let mut results = Vec::with_capacity(due.len());
        for key in due {
            if let Some(acc) = self.open.remove(&key) {
                if self.config.late_policy == LatePolicy::MergeAndCorrect {
                    self.emitted.insert(key.clone(), acc.clone());
                }
                incr(&self.metrics.windows_emitted);
                results.push(self.build_result(key, acc, false));
            }
        }

        // Retention horizon for late-merge state.
        let retention = watermark - self.config.correction_retention_ms;
        self.emitted.retain(|k, _| k.window_end_ms > retention);

        results
    }

    fn build_result(
        &self,
        key: WindowKey,
        accumulator: WindowAccumulator,
        correction: bool,
    ) -> AggregateResult {
        let (enrichment, enrichment_incomplete) = match &self.enricher {
            Some(enricher) => match enricher.enrich(&key) {
                Ok(map) => (Some(map), false),
                Err(e) => {
                    incr(&self.metrics.enrichment_failures);
                    warn!("emitting window {} unenriched: {e}", key.document_id());
                    (None, true)
                }
            },
            None => (None, false),
        };

        AggregateResult {
            key,
            accumulator,
            enrichment,
            enrichment_incomplete,
            correction,
        }
    }
}

enum LateMerge {
    Absorbed,
    Correction(AggregateResult),
    NoState,
}

fn late_dead_letter(event: &LogEvent, horizon_ms: i64) -> DeadLetter {
    DeadLetter {
        partition: event.partition,
        offset: event.offset,
        payload: serde_json::to_vec(event).unwrap_or_default(),
        reason: format!(
            "late event: event_time {} behind lateness horizon {}",
            event.event_time_ms, horizon_ms
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::LogLevel;
    use proptest::prelude::*;

    fn event(partition: u32, time_ms: i64) -> LogEvent {
        event_for("api", partition, time_ms)
    }

    fn event_for(source: &str, partition: u32, time_ms: i64) -> LogEvent {
        LogEvent {
            event_time_ms: time_ms,
            source: source.to_string(),
            level: LogLevel::Info,
            fields: serde_json::Map::new(),
            partition,
            offset: time_ms,
            synthetic_time: false,
        }
    }

    fn aggregator(config: AggregatorConfig) -> WindowedAggregator {
        WindowedAggregator::new(config, None, Arc::new(PipelineMetrics::default()))
    }

    #[test]
    fn test_spec_window_scenario() {
        // 60s windows, 10s lateness: events at 5s, 30s, 58s, 65s.
        let mut agg = aggregator(AggregatorConfig::default());

        for t in [5_000, 30_000, 58_000, 65_000] {
            let out = agg.process(&event(0, t));
            assert!(out.emitted.is_empty(), "nothing due before watermark 70s");
            assert!(out.late.is_none(), "no late classification at t={t}");
        }
        assert_eq!(agg.open_window_count(), 2, "[0,60s) and [60s,120s) open");

        // Watermark reaches 80s: [0,60s) is past 60s + 10s lateness.
        let out = agg.process(&event(0, 80_000));
        assert_eq!(out.emitted.len(), 1);
        let result = &out.emitted[0];
        assert_eq!(result.key.window_start_ms, 0);
        assert_eq!(result.key.window_end_ms, 60_000);
        assert_eq!(result.accumulator.count, 3);
    }

    #[test]
    fn test_emission_order_follows_window_end() {
        // Wide slack keeps all three windows open until the final event.
        let mut agg = aggregator(AggregatorConfig {
            allowed_lateness_ms: 0,
            out_of_order_slack_ms: 200_000,
            ..AggregatorConfig::default()
        });
        agg.process(&event(0, 5_000));
        agg.process(&event(0, 65_000));
        agg.process(&event(0, 125_000));

        let out = agg.process(&event(0, 500_000));
        let ends: Vec<i64> = out.emitted.iter().map(|r| r.key.window_end_ms).collect();
        assert_eq!(ends, vec![60_000, 120_000, 180_000]);
    }

    #[test]
    fn test_late_event_dropped_and_counted() {
        let metrics = Arc::new(PipelineMetrics::default());
        let mut agg = WindowedAggregator::new(
            AggregatorConfig::default(),
            None,
            Arc::clone(&metrics),
        );

        let out = agg.process(&event(0, 200_000));
        let closed = out.emitted.len();
        assert_eq!(closed, 0);

        // Watermark is 200s; an event at 20s is far behind the horizon.
        let out = agg.process(&event(0, 20_000));
        assert!(out.emitted.is_empty());
        let dead = out.late.expect("late event should be dead-lettered");
        assert!(dead.reason.contains("late event"));
        assert_eq!(metrics.snapshot().late_events, 1);
        assert_eq!(agg.open_window_count(), 1, "late event never opens a window");
    }

    #[test]
    fn test_late_event_never_mutates_emitted_window_under_drop() {
        let mut agg = aggregator(AggregatorConfig::default());
        agg.process(&event(0, 5_000));
        let out = agg.process(&event(0, 100_000));
        assert_eq!(out.emitted.len(), 1);
        assert_eq!(out.emitted[0].accumulator.count, 1);

        // Same window, way late: dropped, no correction ever emitted.
        let out = agg.process(&event(0, 6_000));
        assert!(out.emitted.is_empty());
        assert!(out.late.is_some());
    }

    #[test]
    fn test_merge_and_correct_re_emits_closed_window() {
        let mut agg = aggregator(AggregatorConfig {
            late_policy: LatePolicy::MergeAndCorrect,
            ..AggregatorConfig::default()
        });
        agg.process(&event(0, 5_000));
        agg.process(&event(0, 30_000));
        let out = agg.process(&event(0, 100_000));
        assert_eq!(out.emitted.len(), 1);
        assert_eq!(out.emitted[0].accumulator.count, 2);

        let out = agg.process(&event(0, 6_000));
        assert!(out.late.is_none());
        assert_eq!(out.emitted.len(), 1);
        let correction = &out.emitted[0];
        assert!(correction.correction);
        assert_eq!(correction.accumulator.count, 3);
        assert_eq!(
            correction.key.document_id(),
            "window-api-0-60000",
            "correction overwrites the original document"
        );
    }

    #[test]
    fn test_merge_past_retention_falls_back_to_drop() {
        let mut agg = aggregator(AggregatorConfig {
            late_policy: LatePolicy::MergeAndCorrect,
            ..AggregatorConfig::default()
        });
        agg.process(&event(0, 5_000));
        agg.process(&event(0, 100_000)); // closes [0,60s)
        agg.process(&event(0, 500_000)); // retention horizon long past 60s

        let out = agg.process(&event(0, 6_000));
        assert!(out.emitted.is_empty());
        assert!(out.late.is_some(), "no closed accumulator left to merge into");
    }

    #[test]
    fn test_watermark_is_monotonic_per_partition() {
        let mut agg = aggregator(AggregatorConfig::default());
        agg.process(&event(0, 50_000));
        assert_eq!(agg.global_watermark(), Some(50_000));

        // Out-of-order arrival must not regress the watermark.
        agg.process(&event(0, 45_000));
        assert_eq!(agg.global_watermark(), Some(50_000));

        agg.tick();
        assert_eq!(agg.global_watermark(), Some(50_000), "idle tick holds");
    }

    #[test]
    fn test_stalled_partition_holds_back_global_watermark() {
        let mut agg = aggregator(AggregatorConfig {
            allowed_lateness_ms: 0,
            ..AggregatorConfig::default()
        });
        agg.process(&event(0, 10_000));
        agg.process(&event(1, 10_000));

        // Partition 0 races ahead; partition 1 stalls at 10s.
        let out = agg.process(&event(0, 300_000));
        assert_eq!(agg.global_watermark(), Some(10_000));
        assert!(out.emitted.is_empty(), "stalled partition blocks emission");

        // Partition 1 catches up and everything due closes.
        let out = agg.process(&event(1, 300_000));
        assert_eq!(out.emitted.len(), 1);
        assert_eq!(out.emitted[0].accumulator.count, 2);
    }

    #[test]
    fn test_out_of_order_slack_delays_watermark() {
        let mut agg = aggregator(AggregatorConfig {
            out_of_order_slack_ms: 5_000,
            ..AggregatorConfig::default()
        });
        agg.process(&event(0, 50_000));
        assert_eq!(agg.global_watermark(), Some(45_000));
    }

    #[test]
    fn test_grouping_key_separates_sources() {
        let mut agg = aggregator(AggregatorConfig {
            allowed_lateness_ms: 0,
            ..AggregatorConfig::default()
        });
        agg.process(&event_for("api", 0, 5_000));
        agg.process(&event_for("db", 0, 6_000));

        let out = agg.process(&event(0, 100_000));
        assert_eq!(out.emitted.len(), 2);
        let mut keys: Vec<&str> = out
            .emitted
            .iter()
            .map(|r| r.key.grouping_key.as_str())
            .collect();
        keys.sort_unstable();
        assert_eq!(keys, vec!["api", "db"]);
    }

    #[test]
    fn test_snapshot_restore_preserves_pending_state() {
        let config = AggregatorConfig::default();
        let mut uninterrupted = aggregator(config.clone());
        let mut first = aggregator(config.clone());

        for t in [5_000, 30_000, 58_000] {
            uninterrupted.process(&event(0, t));
            first.process(&event(0, t));
        }

        let snapshot = first.snapshot();
        let mut resumed = aggregator(config);
        resumed.restore(snapshot);

        let a = uninterrupted.process(&event(0, 100_000));
        let b = resumed.process(&event(0, 100_000));
        assert_eq!(a.emitted, b.emitted);
        assert_eq!(
            uninterrupted.global_watermark(),
            resumed.global_watermark()
        );
    }

    struct StaticEnricher {
        fail: bool,
    }

    impl Enricher for StaticEnricher {
        fn enrich(
            &self,
            key: &WindowKey,
        ) -> Result<serde_json::Map<String, serde_json::Value>, EnrichError> {
            if self.fail {
                return Err(EnrichError("side table unavailable".to_string()));
            }
            let mut map = serde_json::Map::new();
            map.insert("team".to_string(), format!("owners-of-{}", key.grouping_key).into());
            Ok(map)
        }
    }

    #[test]
    fn test_enrichment_applied_at_emission() {
        let mut agg = WindowedAggregator::new(
            AggregatorConfig::default(),
            Some(Arc::new(StaticEnricher { fail: false })),
            Arc::new(PipelineMetrics::default()),
        );
        agg.process(&event(0, 5_000));
        let out = agg.process(&event(0, 100_000));
        let result = &out.emitted[0];
        assert!(!result.enrichment_incomplete);
        let enrichment = result.enrichment.as_ref().expect("enriched");
        assert_eq!(enrichment["team"], "owners-of-api");
    }

    #[test]
    fn test_enrichment_failure_never_blocks_emission() {
        let metrics = Arc::new(PipelineMetrics::default());
        let mut agg = WindowedAggregator::new(
            AggregatorConfig::default(),
            Some(Arc::new(StaticEnricher { fail: true })),
            Arc::clone(&metrics),
        );
        agg.process(&event(0, 5_000));
        let out = agg.process(&event(0, 100_000));
        let result = &out.emitted[0];
        assert!(result.enrichment.is_none());
        assert!(result.enrichment_incomplete);
        assert_eq!(metrics.snapshot().enrichment_failures, 1);
    }

    proptest! {
        /// The aggregate for a window is a pure function of the event set:
        /// arrival order must not matter as long as nothing goes late.
        #[test]
        fn prop_arrival_order_does_not_change_aggregate(
            mut times in proptest::collection::vec(0i64..60_000, 1..40)
        ) {
            let run = |times: &[i64]| {
                let mut agg = aggregator(AggregatorConfig {
                    // Slack wide enough that in-window shuffling never goes late.
                    out_of_order_slack_ms: 60_000,
                    ..AggregatorConfig::default()
                });
                for &t in times {
                    let out = agg.process(&event(0, t));
                    prop_assert!(out.late.is_none());
                }
                let out = agg.process(&event(0, 200_000));
                prop_assert_eq!(out.emitted.len(), 1);
                Ok(out.emitted[0].accumulator.clone())
            };

            let ordered = run(&times)?;
            times.reverse();
            let reversed = run(&times)?;
            prop_assert_eq!(ordered, reversed);
        }

        /// Watermarks never regress for any input ordering.
        #[test]
        fn prop_watermark_never_regresses(
            times in proptest::collection::vec(0i64..1_000_000, 1..50)
        ) {
            let mut agg = aggregator(AggregatorConfig {
                late_policy: LatePolicy::Drop,
                ..AggregatorConfig::default()
            });
            let mut last = i64::MIN;
            for &t in &times {
                agg.process(&event(0, t));
                let wm = agg.global_watermark().unwrap_or(i64::MIN);
                prop_assert!(wm >= last, "watermark regressed: {} -> {}", last, wm);
                last = wm;
            }
        }
    }
}
