// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use dls_stream_processor::checkpoint::CheckpointError;
use dls_stream_processor::sink::SinkError;
use dls_stream_processor::source::SourceError;

/// Errors that can occur when configuring or running the pipeline
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Source failure: {0}")]
    Source(#[from] SourceError),

    #[error("Sink failure: {0}")]
    Sink(#[from] SinkError),

    #[error("Checkpoint failure: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Pipeline not running")]
    NotRunning,

    #[error("Runtime error: {0}")]
    Runtime(String),
}
