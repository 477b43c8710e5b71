// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::PipelineError;
use dls_stream_processor::aggregator::{AggregatorConfig, LatePolicy};
use dls_stream_processor::backpressure::BackpressureConfig;
use dls_stream_processor::sink::{SinkRetryPolicy, SinkWriterConfig};
use dls_stream_processor::source::SourceRetryConfig;
use std::env;
use std::time::Duration;

/// Configuration for one pipeline instance, read from `DLS_*` environment
/// variables with production defaults.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Fixed aggregation window size in milliseconds
    pub window_size_ms: i64,
    /// How far behind the watermark a window stays open
    pub allowed_lateness_ms: i64,
    /// Watermark lag behind the max observed event time
    pub out_of_order_slack_ms: i64,
    /// What happens to events behind the lateness horizon
    pub late_policy: LatePolicy,
    /// Retention of closed accumulators for late-merge corrections
    pub correction_retention_ms: i64,
    /// Checkpoint cadence in seconds
    pub checkpoint_interval_secs: u64,
    /// Additional checkpoint trigger: records processed since the last one
    pub checkpoint_every_records: u64,
    /// Sink batch size threshold
    pub max_batch_size: usize,
    /// Sink batch age threshold in milliseconds
    pub max_batch_wait_ms: u64,
    /// Whole-batch retry attempts before the sink is declared unavailable
    pub retry_max_attempts: u32,
    /// Ack latency below which the pull rate grows
    pub backpressure_low_watermark_ms: u64,
    /// Ack latency above which the pull rate halves
    pub backpressure_high_watermark_ms: u64,
    /// In-flight batch cap before the pull rate halves
    pub max_in_flight_batches: usize,
    /// How long one poll waits for records
    pub poll_timeout_ms: u64,
    /// Housekeeping cadence: emission scan and backpressure re-evaluation
    pub tick_interval_ms: u64,
    /// Consecutive source failures tolerated before the pipeline halts
    pub source_retry_max_failures: u32,
    /// Identifies this pipeline's checkpoint among instances sharing a store
    pub instance_id: String,
    /// Directory for file-backed checkpoints
    pub checkpoint_dir: String,
    /// Bulk endpoint of the search backend; `None` runs without an HTTP sink
    pub sink_url: Option<String>,
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            window_size_ms: 60_000,
            allowed_lateness_ms: 10_000,
            out_of_order_slack_ms: 0,
            late_policy: LatePolicy::Drop,
            correction_retention_ms: 300_000,
            checkpoint_interval_secs: 30,
            checkpoint_every_records: 10_000,
            max_batch_size: 500,
            max_batch_wait_ms: 2_000,
            retry_max_attempts: 5,
            backpressure_low_watermark_ms: 200,
            backpressure_high_watermark_ms: 1_000,
            max_in_flight_batches: 4,
            poll_timeout_ms: 250,
            tick_interval_ms: 1_000,
            source_retry_max_failures: 10,
            instance_id: "dls-pipeline-0".to_string(),
            checkpoint_dir: "./checkpoints".to_string(),
            sink_url: None,
            log_level: "info".to_string(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|val| val.parse::<T>().ok())
        .unwrap_or(default)
}

impl PipelineConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, PipelineError> {
        let defaults = Self::default();

        let late_policy = match env::var("DLS_LATE_POLICY") {
            Ok(val) => parse_late_policy(&val)?,
            Err(_) => defaults.late_policy,
        };

        let config = Self {
            window_size_ms: env_parse("DLS_WINDOW_SIZE_MS", defaults.window_size_ms),
            allowed_lateness_ms: env_parse("DLS_ALLOWED_LATENESS_MS", defaults.allowed_lateness_ms),
            out_of_order_slack_ms: env_parse(
                "DLS_OUT_OF_ORDER_SLACK_MS",
                defaults.out_of_order_slack_ms,
            ),
            late_policy,
            correction_retention_ms: env_parse(
                "DLS_CORRECTION_RETENTION_MS",
                defaults.correction_retention_ms,
            ),
            checkpoint_interval_secs: env_parse(
                "DLS_CHECKPOINT_INTERVAL_SECS",
                defaults.checkpoint_interval_secs,
            ),
            checkpoint_every_records: env_parse(
                "DLS_CHECKPOINT_EVERY_RECORDS",
                defaults.checkpoint_every_records,
            ),
            max_batch_size: env_parse("DLS_MAX_BATCH_SIZE", defaults.max_batch_size),
            max_batch_wait_ms: env_parse("DLS_MAX_BATCH_WAIT_MS", defaults.max_batch_wait_ms),
            retry_max_attempts: env_parse("DLS_RETRY_MAX_ATTEMPTS", defaults.retry_max_attempts),
            backpressure_low_watermark_ms: env_parse(
                "DLS_BACKPRESSURE_LOW_WATERMARK_MS",
                defaults.backpressure_low_watermark_ms,
            ),
            backpressure_high_watermark_ms: env_parse(
                "DLS_BACKPRESSURE_HIGH_WATERMARK_MS",
                defaults.backpressure_high_watermark_ms,
            ),
            max_in_flight_batches: env_parse(
                "DLS_MAX_IN_FLIGHT_BATCHES",
                defaults.max_in_flight_batches,
            ),
            poll_timeout_ms: env_parse("DLS_POLL_TIMEOUT_MS", defaults.poll_timeout_ms),
            tick_interval_ms: env_parse("DLS_TICK_INTERVAL_MS", defaults.tick_interval_ms),
            source_retry_max_failures: env_parse(
                "DLS_SOURCE_RETRY_MAX_FAILURES",
                defaults.source_retry_max_failures,
            ),
            instance_id: env::var("DLS_INSTANCE_ID").unwrap_or(defaults.instance_id),
            checkpoint_dir: env::var("DLS_CHECKPOINT_DIR").unwrap_or(defaults.checkpoint_dir),
            sink_url: env::var("DLS_SINK_URL").ok(),
            log_level: env::var("DLS_LOG_LEVEL")
                .map(|val| val.to_lowercase())
                .unwrap_or(defaults.log_level),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.window_size_ms <= 0 {
            return Err(PipelineError::InvalidConfig(
                "window size must be positive".to_string(),
            ));
        }
        if self.allowed_lateness_ms < 0 || self.out_of_order_slack_ms < 0 {
            return Err(PipelineError::InvalidConfig(
                "lateness and slack must not be negative".to_string(),
            ));
        }
        if self.correction_retention_ms < self.allowed_lateness_ms {
            return Err(PipelineError::InvalidConfig(
                "correction retention must cover the lateness allowance".to_string(),
            ));
        }
        if self.max_batch_size == 0 {
            return Err(PipelineError::InvalidConfig(
                "sink batch size must be greater than 0".to_string(),
            ));
        }
        if self.checkpoint_interval_secs == 0 && self.checkpoint_every_records == 0 {
            return Err(PipelineError::InvalidConfig(
                "at least one checkpoint trigger must be enabled".to_string(),
            ));
        }
        if self.backpressure_low_watermark_ms >= self.backpressure_high_watermark_ms {
            return Err(PipelineError::InvalidConfig(
                "backpressure low watermark must be below the high watermark".to_string(),
            ));
        }
        if self.instance_id.trim().is_empty() {
            return Err(PipelineError::InvalidConfig(
                "DLS_INSTANCE_ID cannot be empty".to_string(),
            ));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.log_level.as_str()) {
            return Err(PipelineError::InvalidConfig(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        Ok(())
    }

    pub fn aggregator_config(&self) -> AggregatorConfig {
        AggregatorConfig {
            window_size_ms: self.window_size_ms,
            allowed_lateness_ms: self.allowed_lateness_ms,
            out_of_order_slack_ms: self.out_of_order_slack_ms,
            late_policy: self.late_policy,
            correction_retention_ms: self.correction_retention_ms,
        }
    }

    pub fn sink_writer_config(&self) -> SinkWriterConfig {
        SinkWriterConfig {
            max_batch_size: self.max_batch_size,
            max_batch_wait: Duration::from_millis(self.max_batch_wait_ms),
            retry: SinkRetryPolicy {
                max_attempts: self.retry_max_attempts,
                ..SinkRetryPolicy::default()
            },
        }
    }

    pub fn backpressure_config(&self) -> BackpressureConfig {
        BackpressureConfig {
            low_watermark: Duration::from_millis(self.backpressure_low_watermark_ms),
            high_watermark: Duration::from_millis(self.backpressure_high_watermark_ms),
            max_in_flight_batches: self.max_in_flight_batches,
            ..BackpressureConfig::default()
        }
    }

    pub fn source_retry_config(&self) -> SourceRetryConfig {
        SourceRetryConfig {
            max_consecutive_failures: self.source_retry_max_failures,
            ..SourceRetryConfig::default()
        }
    }
}

fn parse_late_policy(value: &str) -> Result<LatePolicy, PipelineError> {
    match value.to_lowercase().as_str() {
        "drop" => Ok(LatePolicy::Drop),
        "merge" | "merge_and_correct" => Ok(LatePolicy::MergeAndCorrect),
        other => Err(PipelineError::InvalidConfig(format!(
            "Invalid late policy '{other}'. Must be 'drop' or 'merge'"
        ))),
    }
}
