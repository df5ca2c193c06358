// ==============================================================================
// pipeline/mod.rs - Bulk Ingestion Pipeline
// ==============================================================================
// Description: Source -> transform workers -> sink workers over bounded queues
// Author: Matt Barham
// Created: 2026-10-01
// Modified: 2026-10-16
// Version: 1.2.0
// ==============================================================================
// Stages:
//   [Source] --queue A--> [Transform x T] --queue B--> [Sink x W]
//
// End of input travels as `Item::EndOfStream`. A worker that reads it puts it
// back into the same queue and stops, so every sibling sees it exactly once.
// The last transform worker to stop forwards a single end marker to queue B.
// ==============================================================================

pub mod engine;
pub mod serial;

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::codec::MalformedRecordError;
use crate::config::{FailurePolicy, LoadConfig};
use crate::store::{SetupError, WriteError};

pub use engine::Pipeline;
pub use serial::run_serial;

/// What travels through a queue
#[derive(Debug)]
pub enum Item<R> {
    Batch(Vec<R>),
    EndOfStream,
}

/// Producer of record batches. Driven by exactly one worker.
#[async_trait]
pub trait Source: Send + 'static {
    type Record: Send + 'static;

    async fn open(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn pre(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Up to `max` records; an empty batch means the input is exhausted
    async fn read_batch(&mut self, max: usize) -> anyhow::Result<Vec<Self::Record>>;

    async fn post(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// In-place batch transformation shared by all transform workers
#[async_trait]
pub trait Transform<R: Send + 'static>: Send + Sync + 'static {
    async fn open(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn pre(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn apply(&self, batch: &mut Vec<R>) -> Result<(), BatchError>;

    async fn post(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Consumer of record batches. One instance per sink worker.
#[async_trait]
pub trait Sink: Send + 'static {
    type Record: Send + 'static;

    async fn open(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn pre(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Persist a batch, returning the number of records written
    async fn write_batch(&mut self, batch: Vec<Self::Record>) -> Result<usize, BatchError>;

    async fn post(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Why a single batch could not be processed
#[derive(Error, Debug)]
pub enum BatchError {
    #[error(transparent)]
    Malformed(#[from] MalformedRecordError),

    #[error(transparent)]
    Write(#[from] WriteError),

    #[error(transparent)]
    Setup(#[from] SetupError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Source,
    Transform,
    Sink,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Source => "source",
            Stage::Transform => "transform",
            Stage::Sink => "sink",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("One-time setup failed: {0}")]
    Setup(SetupError),

    #[error("{stage} worker {worker} failed on a batch of {records} records: {source}")]
    BatchFailed {
        stage: Stage,
        worker: usize,
        records: usize,
        source: BatchError,
    },

    #[error("Source failed to read a batch: {error:#}")]
    Read { error: anyhow::Error },

    #[error("{stage} hook '{hook}' failed: {error:#}")]
    Hook {
        stage: Stage,
        hook: &'static str,
        error: anyhow::Error,
    },

    #[error("Invalid pipeline configuration: {0}")]
    Configuration(String),

    #[error("Pipeline cancelled")]
    Cancelled,

    #[error("Workers did not finish within {0:?}")]
    JoinTimeout(Duration),

    #[error("{stage} worker panicked: {details}")]
    WorkerPanicked { stage: Stage, details: String },
}

/// A batch dropped under the lenient failure policy
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedBatch {
    pub stage: Stage,
    pub worker: usize,
    pub records: usize,
    pub error: String,
}

/// Outcome of one run
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineReport {
    pub batches_read: usize,
    pub records_read: usize,
    pub batches_written: usize,
    pub records_written: usize,
    pub skipped: Vec<SkippedBatch>,
    pub transform_workers_finished: usize,
    pub sink_workers_finished: usize,
    /// End markers left in the source->transform queue
    pub residual_transform_queue_markers: usize,
    /// End markers left in the transform->sink queue
    pub residual_sink_queue_markers: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOptions {
    pub batch_size: usize,
    pub queue_capacity: usize,
    pub transform_workers: usize,
    pub failure_policy: FailurePolicy,
    pub join_timeout: Option<Duration>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self::from(&LoadConfig::default())
    }
}

impl From<&LoadConfig> for PipelineOptions {
    fn from(config: &LoadConfig) -> Self {
        Self {
            batch_size: config.batch_size(),
            queue_capacity: config.queue_capacity(),
            transform_workers: config.transform_workers(),
            failure_policy: config.failure_policy,
            join_timeout: config.join_timeout(),
        }
    }
}
