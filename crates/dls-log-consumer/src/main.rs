// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Runs the DLS log pipeline as a standalone process.
//!
//! Configuration comes from `DLS_*` environment variables; the bulk endpoint
//! of the search backend is required. With `DLS_LOOPBACK=true` a generator
//! task feeds synthetic log records through the in-memory source, which is
//! useful for smoke-testing a deployment without a broker attached.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::env;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dls_pipeline_core::{config::PipelineConfig, pipeline::Pipeline};
use dls_stream_processor::checkpoint::FileCheckpointStore;
use dls_stream_processor::sink::{BulkSink, HttpBulkSink};
use dls_stream_processor::source::InMemorySource;
use serde_json::json;
use tokio::time::{interval, Duration};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

const SINK_TIMEOUT: Duration = Duration::from_secs(5);
const LOOPBACK_EMIT_INTERVAL: Duration = Duration::from_millis(100);
const LOOPBACK_PARTITIONS: u32 = 4;

#[tokio::main]
pub async fn main() {
    let config = match PipelineConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error creating config on consumer startup: {e}");
            return;
        }
    };

    let env_filter = format!("hyper=off,reqwest=off,rustls=off,{}", config.log_level);

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let sink: Arc<dyn BulkSink> = match config.sink_url.as_deref() {
        Some(url) => match HttpBulkSink::new(url.to_string(), SINK_TIMEOUT) {
            Ok(s) => Arc::new(s),
            Err(e) => {
                error!("Error creating sink client: {e}");
                return;
            }
        },
        None => {
            error!("DLS_SINK_URL not set. Shutting down consumer.");
            return;
        }
    };

    let store = Arc::new(FileCheckpointStore::new(
        config.checkpoint_dir.clone(),
        config.instance_id.clone(),
    ));

    let source = InMemorySource::new();
    let loopback = env::var("DLS_LOOPBACK")
        .map(|val| val.to_lowercase() == "true")
        .unwrap_or(false);
    if loopback {
        info!("loopback generator enabled");
        spawn_loopback_generator(source.clone());
    }

    let pipeline = match Pipeline::new(config, Arc::new(source), sink, store) {
        Ok(p) => p,
        Err(e) => {
            error!("Error assembling pipeline: {e}");
            return;
        }
    };

    let handle = match pipeline.start().await {
        Ok(h) => h,
        Err(e) => {
            error!("Error starting pipeline: {e}");
            return;
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Error listening for shutdown signal: {e}");
            }
            info!("Shutdown signal received");
            if let Err(e) = handle.stop().await {
                error!("Error stopping pipeline: {e}");
            }
            handle.wait_stopped().await;
        }
        _ = handle.wait_stopped() => {
            error!("Pipeline halted on its own");
        }
    }

    handle.metrics().log_stats();
    info!("Consumer stopped");
}

/// Feed synthetic records through the in-memory source at a fixed cadence,
/// spread over a few partitions so the watermark logic is exercised.
fn spawn_loopback_generator(source: InMemorySource) {
    tokio::spawn(async move {
        let levels = ["INFO", "INFO", "INFO", "WARN", "ERROR", "DEBUG"];
        let mut ticker = interval(LOOPBACK_EMIT_INTERVAL);
        let mut seq: u64 = 0;
        loop {
            ticker.tick().await;
            let now = now_ms();
            let payload = json!({
                "timestamp_ms": now,
                "source": "loopback",
                "level": levels[seq as usize % levels.len()],
                "seq": seq,
            })
            .to_string();
            source.push(
                (seq % u64::from(LOOPBACK_PARTITIONS)) as u32,
                b"loopback",
                payload.as_bytes(),
                now,
            );
            seq += 1;
        }
    });
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
