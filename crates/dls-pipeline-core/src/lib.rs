// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Lifecycle coordination for the DLS log pipeline.
//!
//! Wires the processing stages from `dls-stream-processor` into one running
//! service: environment-driven configuration, the poll/normalize/aggregate
//! loop, checkpoint cadence, backpressure ticks, and graceful shutdown.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod config;
pub mod error;
pub mod pipeline;
