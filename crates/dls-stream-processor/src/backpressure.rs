// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pull-rate control loop.
//!
//! Congestion avoidance over the sink, not a fixed rate limit: additive
//! increase while observed ack latency stays under the low watermark,
//! multiplicative decrease (halve) when latency crosses the high watermark,
//! too many batches are in flight, or a whole window passes with work
//! outstanding and no acks at all. Re-evaluated on a fixed tick from the
//! pipeline loop; the source consumes [`PullRateController::allowed_pull_rate`]
//! before every poll.

use crate::sink::SinkStats;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct BackpressureConfig {
    pub low_watermark: Duration,
    pub high_watermark: Duration,
    pub max_in_flight_batches: usize,
    pub min_rate: usize,
    pub max_rate: usize,
    /// Records added to the pull rate per tick during additive increase.
    pub increase_step: usize,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        BackpressureConfig {
            low_watermark: Duration::from_millis(200),
            high_watermark: Duration::from_millis(1_000),
            max_in_flight_batches: 4,
            min_rate: 10,
            max_rate: 5_000,
            increase_step: 50,
        }
    }
}

pub struct PullRateController {
    config: BackpressureConfig,
    rate: usize,
    /// Ack totals at the previous tick, for windowed averages.
    seen_acks: u64,
    seen_latency_ms: u64,
}

impl PullRateController {
    pub fn new(config: BackpressureConfig) -> Self {
        let rate = config.max_rate.min(500).max(config.min_rate);
        PullRateController {
            config,
            rate,
            seen_acks: 0,
            seen_latency_ms: 0,
        }
    }

    pub fn allowed_pull_rate(&self) -> usize {
        self.rate
    }

    /// One control-loop step: fold in the ack latency observed since the
    /// previous tick and the current in-flight count, then adjust the rate.
    pub fn tick(&mut self, stats: &SinkStats) -> usize {
        let acks = stats.acked_batches.load(Ordering::Relaxed);
        let latency_ms = stats.total_ack_latency_ms.load(Ordering::Relaxed);
        let in_flight = stats.in_flight_batches.load(Ordering::Relaxed);

        let new_acks = acks.saturating_sub(self.seen_acks);
        let new_latency_ms = latency_ms.saturating_sub(self.seen_latency_ms);
        self.seen_acks = acks;
        self.seen_latency_ms = latency_ms;

        let avg_latency = if new_acks > 0 {
            Some(Duration::from_millis(new_latency_ms / new_acks))
        } else {
            None
        };

        self.adjust(avg_latency, in_flight)
    }

    fn adjust(&mut self, avg_latency: Option<Duration>, in_flight: usize) -> usize {
        // No acks while a batch is outstanding is a stall, not headroom;
        // only a window with nothing in flight counts as idle.
        let stalled = avg_latency.is_none() && in_flight > 0;
        let over_capacity = stalled
            || in_flight > self.config.max_in_flight_batches
            || avg_latency.is_some_and(|l| l >= self.config.high_watermark);
        let under_capacity = match avg_latency {
            Some(latency) => latency < self.config.low_watermark,
            None => in_flight == 0,
        };

        let previous = self.rate;
        if over_capacity {
            self.rate = (self.rate / 2).max(self.config.min_rate);
        } else if under_capacity {
            self.rate = (self.rate + self.config.increase_step).min(self.config.max_rate);
        }
        // Between the watermarks: hold.

        if self.rate != previous {
            debug!(
                previous,
                rate = self.rate,
                in_flight,
                avg_latency_ms = avg_latency.map(|l| l.as_millis() as u64),
                "pull rate adjusted"
            );
        }
        self.rate
    }
}
