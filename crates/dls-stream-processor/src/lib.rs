// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Stream-processing core of the DLS log pipeline.
//!
//! Raw log records are pulled from a partitioned, offset-addressable source,
//! normalized into structured events, aggregated into fixed time windows, and
//! written to a search backend as idempotent bulk upserts. Progress (source
//! offsets plus in-flight window state) is checkpointed atomically so a crash
//! resumes from the last durable snapshot with bounded reprocessing.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod aggregator;
pub mod aggregator_service;
pub mod backpressure;
pub mod checkpoint;
pub mod dead_letter;
pub mod metrics;
pub mod normalizer;
pub mod record;
pub mod sink;
pub mod source;
