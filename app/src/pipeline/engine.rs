// ==============================================================================
// pipeline/engine.rs - Pipelined Execution
// ==============================================================================
// Description: Runs one source worker, T transform workers and W sink workers
// Author: Matt Barham
// Created: 2026-10-01
// Modified: 2026-10-19
// Version: 1.3.0
// ==============================================================================
// Backpressure comes only from the bounded queues: a slow sink stalls the
// transform stage, which stalls the source. Every blocking queue operation
// also watches the cancellation token.
// ==============================================================================

use async_channel::{Receiver, Sender};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    BatchError, Item, PipelineError, PipelineOptions, PipelineReport, SkippedBatch, Sink, Source,
    Stage, Transform,
};
use crate::config::FailurePolicy;

type Transforms<R> = Arc<Vec<Arc<dyn Transform<R>>>>;

/// How long cancelled workers get to hand back their instances after a join timeout
const CLOSE_GRACE: Duration = Duration::from_secs(5);

pub struct Pipeline<S: Source, K: Sink<Record = S::Record>> {
    source: S,
    transforms: Vec<Arc<dyn Transform<S::Record>>>,
    sinks: Vec<K>,
    options: PipelineOptions,
    cancel: CancellationToken,
}

impl<S, K> Pipeline<S, K>
where
    S: Source,
    K: Sink<Record = S::Record>,
{
    /// One sink worker is started per sink instance
    pub fn new(source: S, sinks: Vec<K>, options: PipelineOptions) -> Self {
        Self {
            source,
            transforms: Vec::new(),
            sinks,
            options,
            cancel: CancellationToken::new(),
        }
    }

    /// Append a transform; transforms run in insertion order
    pub fn with_transform(mut self, transform: Arc<dyn Transform<S::Record>>) -> Self {
        self.transforms.push(transform);
        self
    }

    /// Run under an externally owned token
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that stops every worker at its next queue operation
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn run(self) -> Result<PipelineReport, PipelineError> {
        let Pipeline {
            mut source,
            transforms,
            mut sinks,
            options,
            cancel,
        } = self;

        if sinks.is_empty() {
            return Err(PipelineError::Configuration(
                "at least one sink is required".to_string(),
            ));
        }
        let transform_workers = options.transform_workers.max(1);
        let sink_workers = sinks.len();

        info!(
            "Starting pipeline: 1 source, {} transform workers, {} sink workers, batch size {}, queue capacity {}",
            transform_workers, sink_workers, options.batch_size, options.queue_capacity
        );

        // Lifecycle: open/pre on every instance before any worker starts
        if let Err(error) = open_all(&mut source, transforms.as_slice(), &mut sinks).await {
            finish(Some(&mut source), transforms.as_slice(), &mut sinks, false).await;
            return Err(error);
        }

        let capacity = options.queue_capacity.max(1);
        let (transform_tx, transform_rx) = async_channel::bounded::<Item<S::Record>>(capacity);
        let (sink_tx, sink_rx) = async_channel::bounded::<Item<S::Record>>(capacity);

        let shared = Arc::new(Shared::new(options.failure_policy, cancel.clone()));
        let transforms: Transforms<S::Record> = Arc::new(transforms);
        let remaining_transforms = Arc::new(AtomicUsize::new(transform_workers));

        let source_handle = tokio::spawn(run_source(
            source,
            transform_tx.clone(),
            shared.clone(),
            options.batch_size.max(1),
        ));

        let mut transform_set = JoinSet::new();
        for worker in 0..transform_workers {
            transform_set.spawn(run_transform(
                worker,
                transform_rx.clone(),
                transform_tx.clone(),
                sink_tx.clone(),
                transforms.clone(),
                remaining_transforms.clone(),
                shared.clone(),
            ));
        }

        let mut sink_set = JoinSet::new();
        for (worker, sink) in sinks.drain(..).enumerate() {
            sink_set.spawn(run_sink(
                worker,
                sink,
                sink_rx.clone(),
                sink_tx.clone(),
                shared.clone(),
            ));
        }

        let mut workers = Workers::new(source_handle, transform_set, sink_set);
        let timed_out = match options.join_timeout {
            Some(limit) => match tokio::time::timeout(limit, workers.join(&cancel)).await {
                Ok(()) => None,
                Err(_) => Some(limit),
            },
            None => {
                workers.join(&cancel).await;
                None
            }
        };
        if let Some(limit) = timed_out {
            error!("Pipeline workers still running after {:?}, cancelling", limit);
            cancel.cancel();
            if tokio::time::timeout(CLOSE_GRACE, workers.join(&cancel))
                .await
                .is_err()
            {
                warn!(
                    "{} workers ignored cancellation for {:?}; their close hooks are skipped",
                    workers.stranded(),
                    CLOSE_GRACE
                );
            }
        }
        let mut finished_source = workers.source.take();
        let mut finished_sinks = std::mem::take(&mut workers.sinks);
        let panic = workers.panic.take();
        drop(workers);

        let failure = shared.take_failure().await;
        let succeeded = timed_out.is_none()
            && panic.is_none()
            && failure.is_none()
            && !cancel.is_cancelled();

        // Lifecycle: post/close once the stage's workers are all gone.
        // A panicked worker took its instance with it and is not closed.
        finish(
            finished_source.as_mut(),
            transforms.as_slice(),
            &mut finished_sinks,
            succeeded,
        )
        .await;

        if let Some(limit) = timed_out {
            return Err(PipelineError::JoinTimeout(limit));
        }
        if let Some(panic) = panic {
            return Err(panic);
        }
        if let Some(failure) = failure {
            return Err(failure);
        }
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let mut report = shared.report().await;
        report.residual_transform_queue_markers = drain_markers(&transform_rx);
        report.residual_sink_queue_markers = drain_markers(&sink_rx);

        info!(
            "Pipeline finished: {} records in {} batches read, {} records written, {} batches skipped",
            report.records_read,
            report.batches_read,
            report.records_written,
            report.skipped.len()
        );
        Ok(report)
    }
}

/// State shared by every worker of one run
struct Shared {
    policy: FailurePolicy,
    cancel: CancellationToken,
    batches_read: AtomicUsize,
    records_read: AtomicUsize,
    batches_written: AtomicUsize,
    records_written: AtomicUsize,
    transform_workers_finished: AtomicUsize,
    sink_workers_finished: AtomicUsize,
    skipped: Mutex<Vec<SkippedBatch>>,
    failure: Mutex<Option<PipelineError>>,
}

impl Shared {
    fn new(policy: FailurePolicy, cancel: CancellationToken) -> Self {
        Self {
            policy,
            cancel,
            batches_read: AtomicUsize::new(0),
            records_read: AtomicUsize::new(0),
            batches_written: AtomicUsize::new(0),
            records_written: AtomicUsize::new(0),
            transform_workers_finished: AtomicUsize::new(0),
            sink_workers_finished: AtomicUsize::new(0),
            skipped: Mutex::new(Vec::new()),
            failure: Mutex::new(None),
        }
    }

    /// Record a fatal error (first one wins) and stop every worker
    async fn fail(&self, error: PipelineError) {
        let mut failure = self.failure.lock().await;
        if failure.is_none() {
            *failure = Some(error);
        }
        self.cancel.cancel();
    }

    /// Apply the failure policy to a failed batch. Returns `true` to keep going.
    async fn batch_failed(&self, stage: Stage, worker: usize, records: usize, error: BatchError) -> bool {
        if let BatchError::Setup(setup) = error {
            error!("{} worker {}: one-time setup failed: {}", stage, worker, setup);
            self.fail(PipelineError::Setup(setup)).await;
            return false;
        }

        self.skipped.lock().await.push(SkippedBatch {
            stage,
            worker,
            records,
            error: error.to_string(),
        });

        match self.policy {
            FailurePolicy::Lenient => {
                warn!(
                    "{} worker {}: skipping batch of {} records: {}",
                    stage, worker, records, error
                );
                true
            }
            FailurePolicy::Strict => {
                error!(
                    "{} worker {}: batch of {} records failed, aborting: {}",
                    stage, worker, records, error
                );
                self.fail(PipelineError::BatchFailed {
                    stage,
                    worker,
                    records,
                    source: error,
                })
                .await;
                false
            }
        }
    }

    async fn take_failure(&self) -> Option<PipelineError> {
        self.failure.lock().await.take()
    }

    async fn report(&self) -> PipelineReport {
        PipelineReport {
            batches_read: self.batches_read.load(Ordering::Acquire),
            records_read: self.records_read.load(Ordering::Acquire),
            batches_written: self.batches_written.load(Ordering::Acquire),
            records_written: self.records_written.load(Ordering::Acquire),
            skipped: self.skipped.lock().await.clone(),
            transform_workers_finished: self.transform_workers_finished.load(Ordering::Acquire),
            sink_workers_finished: self.sink_workers_finished.load(Ordering::Acquire),
            residual_transform_queue_markers: 0,
            residual_sink_queue_markers: 0,
        }
    }
}

/// Cancels the run if the owning worker unwinds
struct CancelOnPanic(CancellationToken);

impl Drop for CancelOnPanic {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.cancel();
        }
    }
}

/// Blocking push; `false` if the run was cancelled first
async fn push<R>(queue: &Sender<Item<R>>, item: Item<R>, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = queue.send(item) => sent.is_ok(),
    }
}

/// Blocking pop; `None` if the run was cancelled first
async fn pop<R>(queue: &Receiver<Item<R>>, cancel: &CancellationToken) -> Option<Item<R>> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        item = queue.recv() => item.ok(),
    }
}

async fn run_source<S: Source>(
    mut source: S,
    queue: Sender<Item<S::Record>>,
    shared: Arc<Shared>,
    batch_size: usize,
) -> S {
    let _guard = CancelOnPanic(shared.cancel.clone());
    debug!("Source worker started");

    loop {
        let batch = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => None,
            batch = source.read_batch(batch_size) => Some(batch),
        };

        match batch {
            None => break,
            Some(Ok(batch)) if batch.is_empty() => {
                debug!("Source exhausted, signalling end of stream");
                push(&queue, Item::EndOfStream, &shared.cancel).await;
                break;
            }
            Some(Ok(batch)) => {
                shared.batches_read.fetch_add(1, Ordering::AcqRel);
                shared.records_read.fetch_add(batch.len(), Ordering::AcqRel);
                if !push(&queue, Item::Batch(batch), &shared.cancel).await {
                    break;
                }
            }
            Some(Err(error)) => {
                error!("Source read failed: {:#}", error);
                shared.fail(PipelineError::Read { error }).await;
                break;
            }
        }
    }

    debug!("Source worker finished");
    source
}

async fn run_transform<R: Send + 'static>(
    worker: usize,
    input: Receiver<Item<R>>,
    input_back: Sender<Item<R>>,
    output: Sender<Item<R>>,
    transforms: Transforms<R>,
    remaining: Arc<AtomicUsize>,
    shared: Arc<Shared>,
) {
    let _guard = CancelOnPanic(shared.cancel.clone());
    debug!("Transform worker {} started", worker);

    loop {
        match pop(&input, &shared.cancel).await {
            None => return,
            Some(Item::EndOfStream) => {
                // Put it back for the sibling workers
                if !push(&input_back, Item::EndOfStream, &shared.cancel).await {
                    return;
                }
                break;
            }
            Some(Item::Batch(mut batch)) => {
                let records = batch.len();
                match apply_transforms(&transforms, &mut batch).await {
                    Ok(()) => {
                        if !push(&output, Item::Batch(batch), &shared.cancel).await {
                            return;
                        }
                    }
                    Err(error) => {
                        if !shared
                            .batch_failed(Stage::Transform, worker, records, error)
                            .await
                        {
                            return;
                        }
                    }
                }
            }
        }
    }

    shared
        .transform_workers_finished
        .fetch_add(1, Ordering::AcqRel);
    if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
        debug!("Transform worker {} is the last one, forwarding end of stream", worker);
        push(&output, Item::EndOfStream, &shared.cancel).await;
    }
    debug!("Transform worker {} finished", worker);
}

async fn apply_transforms<R: Send + 'static>(
    transforms: &Transforms<R>,
    batch: &mut Vec<R>,
) -> Result<(), BatchError> {
    for transform in transforms.iter() {
        transform.apply(batch).await?;
    }
    Ok(())
}

async fn run_sink<K: Sink>(
    worker: usize,
    mut sink: K,
    input: Receiver<Item<K::Record>>,
    input_back: Sender<Item<K::Record>>,
    shared: Arc<Shared>,
) -> K {
    let _guard = CancelOnPanic(shared.cancel.clone());
    debug!("Sink worker {} started", worker);

    loop {
        match pop(&input, &shared.cancel).await {
            None => return sink,
            Some(Item::EndOfStream) => {
                if !push(&input_back, Item::EndOfStream, &shared.cancel).await {
                    return sink;
                }
                break;
            }
            Some(Item::Batch(batch)) => {
                let records = batch.len();
                let written = tokio::select! {
                    biased;
                    _ = shared.cancel.cancelled() => None,
                    written = sink.write_batch(batch) => Some(written),
                };
                let written = match written {
                    Some(written) => written,
                    None => return sink,
                };
                match written {
                    Ok(count) => {
                        shared.batches_written.fetch_add(1, Ordering::AcqRel);
                        shared.records_written.fetch_add(count, Ordering::AcqRel);
                    }
                    Err(error) => {
                        if !shared.batch_failed(Stage::Sink, worker, records, error).await {
                            return sink;
                        }
                    }
                }
            }
        }
    }

    shared.sink_workers_finished.fetch_add(1, Ordering::AcqRel);
    debug!("Sink worker {} finished", worker);
    sink
}

/// Join handles of one run plus whatever they have handed back so far.
///
/// `join` is cancel-safe: a handle is only dropped once its task has been
/// collected, so a timed-out join can simply be awaited again.
struct Workers<S, K> {
    source_handle: Option<JoinHandle<S>>,
    transforms: JoinSet<()>,
    sink_handles: JoinSet<K>,
    source: Option<S>,
    sinks: Vec<K>,
    panic: Option<PipelineError>,
}

impl<S, K> Workers<S, K>
where
    S: Send + 'static,
    K: Send + 'static,
{
    fn new(source: JoinHandle<S>, transforms: JoinSet<()>, sinks: JoinSet<K>) -> Self {
        let capacity = sinks.len();
        Self {
            source_handle: Some(source),
            transforms,
            sink_handles: sinks,
            source: None,
            sinks: Vec::with_capacity(capacity),
            panic: None,
        }
    }

    /// Wait for every worker, including the healthy ones after a panic
    async fn join(&mut self, cancel: &CancellationToken) {
        if let Some(handle) = self.source_handle.as_mut() {
            let result = handle.await;
            self.source_handle = None;
            match result {
                Ok(source) => self.source = Some(source),
                Err(e) => self.panicked(Stage::Source, e, cancel),
            }
        }

        while let Some(result) = self.transforms.join_next().await {
            if let Err(e) = result {
                self.panicked(Stage::Transform, e, cancel);
            }
        }

        while let Some(result) = self.sink_handles.join_next().await {
            match result {
                Ok(sink) => self.sinks.push(sink),
                Err(e) => self.panicked(Stage::Sink, e, cancel),
            }
        }
    }

    /// First panic wins; the rest are logged
    fn panicked(&mut self, stage: Stage, e: JoinError, cancel: &CancellationToken) {
        error!("{} worker panicked: {}", stage, e);
        cancel.cancel();
        if self.panic.is_none() {
            self.panic = Some(PipelineError::WorkerPanicked {
                stage,
                details: e.to_string(),
            });
        }
    }

    fn stranded(&self) -> usize {
        usize::from(self.source_handle.is_some()) + self.transforms.len() + self.sink_handles.len()
    }
}

impl<S, K> Drop for Workers<S, K> {
    fn drop(&mut self) {
        // JoinSet aborts its own tasks on drop; a bare handle only detaches
        if let Some(handle) = self.source_handle.take() {
            handle.abort();
        }
    }
}

async fn open_all<S, K>(
    source: &mut S,
    transforms: &[Arc<dyn Transform<S::Record>>],
    sinks: &mut [K],
) -> Result<(), PipelineError>
where
    S: Source,
    K: Sink<Record = S::Record>,
{
    hook(Stage::Source, "open", source.open()).await?;
    hook(Stage::Source, "pre", source.pre()).await?;
    for transform in transforms {
        hook(Stage::Transform, "open", transform.open()).await?;
        hook(Stage::Transform, "pre", transform.pre()).await?;
    }
    for sink in sinks.iter_mut() {
        hook(Stage::Sink, "open", sink.open()).await?;
        hook(Stage::Sink, "pre", sink.pre()).await?;
    }
    Ok(())
}

/// post (clean runs only) then close on every instance still at hand
async fn finish<S, K>(
    source: Option<&mut S>,
    transforms: &[Arc<dyn Transform<S::Record>>],
    sinks: &mut [K],
    succeeded: bool,
) where
    S: Source,
    K: Sink<Record = S::Record>,
{
    if let Some(source) = source {
        if succeeded {
            log_hook(Stage::Source, "post", source.post().await);
        }
        log_hook(Stage::Source, "close", source.close().await);
    }
    for transform in transforms {
        if succeeded {
            log_hook(Stage::Transform, "post", transform.post().await);
        }
        log_hook(Stage::Transform, "close", transform.close().await);
    }
    for sink in sinks.iter_mut() {
        if succeeded {
            log_hook(Stage::Sink, "post", sink.post().await);
        }
        log_hook(Stage::Sink, "close", sink.close().await);
    }
}

async fn hook<F>(stage: Stage, name: &'static str, call: F) -> Result<(), PipelineError>
where
    F: std::future::Future<Output = anyhow::Result<()>>,
{
    call.await.map_err(|error| {
        error!("{} {} hook failed: {:#}", stage, name, error);
        PipelineError::Hook {
            stage,
            hook: name,
            error,
        }
    })
}

fn log_hook(stage: Stage, name: &str, result: anyhow::Result<()>) {
    if let Err(e) = result {
        warn!("{} {} hook failed: {:#}", stage, name, e);
    }
}

fn drain_markers<R>(queue: &Receiver<Item<R>>) -> usize {
    let mut markers = 0;
    while let Ok(item) = queue.try_recv() {
        if matches!(item, Item::EndOfStream) {
            markers += 1;
        }
    }
    markers
}
