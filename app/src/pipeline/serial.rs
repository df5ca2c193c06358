// ==============================================================================
// pipeline/serial.rs - Single-Task Execution
// ==============================================================================
// Description: Read, transform and write on the calling task with no queues
// Author: Matt Barham
// Created: 2026-10-03
// Modified: 2026-10-19
// Version: 1.2.0
// ==============================================================================

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    BatchError, PipelineError, PipelineOptions, PipelineReport, SkippedBatch, Sink, Source, Stage,
    Transform,
};
use crate::config::FailurePolicy;

/// Run a source, its transforms and one sink in a single loop.
///
/// Lifecycle hooks and the failure policy behave exactly as in
/// [`Pipeline::run`](super::Pipeline::run); only the concurrency differs.
pub async fn run_serial<S, K>(
    mut source: S,
    transforms: Vec<Arc<dyn Transform<S::Record>>>,
    mut sink: K,
    options: &PipelineOptions,
    cancel: CancellationToken,
) -> Result<PipelineReport, PipelineError>
where
    S: Source,
    K: Sink<Record = S::Record>,
{
    let batch_size = options.batch_size.max(1);
    info!("Starting serial load, batch size {}", batch_size);

    if let Err(error) = open(&mut source, &transforms, &mut sink).await {
        finish(&mut source, &transforms, &mut sink, false).await;
        return Err(error);
    }

    let mut report = PipelineReport::default();
    let outcome = drive(
        &mut source,
        &transforms,
        &mut sink,
        batch_size,
        options.failure_policy,
        &cancel,
        &mut report,
    )
    .await;

    finish(&mut source, &transforms, &mut sink, outcome.is_ok()).await;

    outcome?;

    report.transform_workers_finished = 1;
    report.sink_workers_finished = 1;
    info!(
        "Serial load finished: {} records in {} batches read, {} records written, {} batches skipped",
        report.records_read,
        report.batches_read,
        report.records_written,
        report.skipped.len()
    );
    Ok(report)
}

async fn open<S, K>(
    source: &mut S,
    transforms: &[Arc<dyn Transform<S::Record>>],
    sink: &mut K,
) -> Result<(), PipelineError>
where
    S: Source,
    K: Sink<Record = S::Record>,
{
    fn hook_error(stage: Stage, hook: &'static str) -> impl FnOnce(anyhow::Error) -> PipelineError {
        move |error| {
            error!("{} {} hook failed: {:#}", stage, hook, error);
            PipelineError::Hook { stage, hook, error }
        }
    }

    source.open().await.map_err(hook_error(Stage::Source, "open"))?;
    source.pre().await.map_err(hook_error(Stage::Source, "pre"))?;
    for transform in transforms {
        transform
            .open()
            .await
            .map_err(hook_error(Stage::Transform, "open"))?;
        transform
            .pre()
            .await
            .map_err(hook_error(Stage::Transform, "pre"))?;
    }
    sink.open().await.map_err(hook_error(Stage::Sink, "open"))?;
    sink.pre().await.map_err(hook_error(Stage::Sink, "pre"))?;
    Ok(())
}

async fn drive<S, K>(
    source: &mut S,
    transforms: &[Arc<dyn Transform<S::Record>>],
    sink: &mut K,
    batch_size: usize,
    policy: FailurePolicy,
    cancel: &CancellationToken,
    report: &mut PipelineReport,
) -> Result<(), PipelineError>
where
    S: Source,
    K: Sink<Record = S::Record>,
{
    loop {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let mut batch = source.read_batch(batch_size).await.map_err(|error| {
            error!("Source read failed: {:#}", error);
            PipelineError::Read { error }
        })?;
        if batch.is_empty() {
            debug!("Source exhausted");
            return Ok(());
        }
        let records = batch.len();
        report.batches_read += 1;
        report.records_read += records;

        let mut transformed = Ok(());
        for transform in transforms {
            transformed = transform.apply(&mut batch).await;
            if transformed.is_err() {
                break;
            }
        }
        if let Err(error) = transformed {
            skip_or_fail(Stage::Transform, records, error, policy, report)?;
            continue;
        }

        match sink.write_batch(batch).await {
            Ok(count) => {
                report.batches_written += 1;
                report.records_written += count;
            }
            Err(error) => skip_or_fail(Stage::Sink, records, error, policy, report)?,
        }
    }
}

async fn finish<S, K>(
    source: &mut S,
    transforms: &[Arc<dyn Transform<S::Record>>],
    sink: &mut K,
    succeeded: bool,
) where
    S: Source,
    K: Sink<Record = S::Record>,
{
    if succeeded {
        log_hook(Stage::Source, "post", source.post().await);
    }
    log_hook(Stage::Source, "close", source.close().await);
    for transform in transforms {
        if succeeded {
            log_hook(Stage::Transform, "post", transform.post().await);
        }
        log_hook(Stage::Transform, "close", transform.close().await);
    }
    if succeeded {
        log_hook(Stage::Sink, "post", sink.post().await);
    }
    log_hook(Stage::Sink, "close", sink.close().await);
}

fn skip_or_fail(
    stage: Stage,
    records: usize,
    error: BatchError,
    policy: FailurePolicy,
    report: &mut PipelineReport,
) -> Result<(), PipelineError> {
    if let BatchError::Setup(setup) = error {
        error!("{}: one-time setup failed: {}", stage, setup);
        return Err(PipelineError::Setup(setup));
    }

    report.skipped.push(SkippedBatch {
        stage,
        worker: 0,
        records,
        error: error.to_string(),
    });

    match policy {
        FailurePolicy::Lenient => {
            warn!("{}: skipping batch of {} records: {}", stage, records, error);
            Ok(())
        }
        FailurePolicy::Strict => {
            error!("{}: batch of {} records failed, aborting: {}", stage, records, error);
            Err(PipelineError::BatchFailed {
                stage,
                worker: 0,
                records,
                source: error,
            })
        }
    }
}

fn log_hook(stage: Stage, name: &str, result: anyhow::Result<()>) {
    if let Err(e) = result {
        warn!("{} {} hook failed: {:#}", stage, name, e);
    }
}
