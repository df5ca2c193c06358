// ==============================================================================
// loader.rs - Load Orchestrator
// ==============================================================================
// Description: Wires a record source and per-worker document sinks together
// Author: Matt Barham
// Created: 2026-10-06
// Modified: 2026-10-17
// Version: 1.2.0
// ==============================================================================
// parallelism == 1  -> serial load on the calling task, one sink
// parallelism == P  -> pipeline with T transform workers and P - 1 sinks,
//                      each sink holding its own codec and store connection
// ==============================================================================

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::codec::{
    CodecOptions, GroupedGenotypeCodec, MalformedRecordError, SampleCodec, StudyEntryCodec,
};
use crate::config::LoadConfig;
use crate::models::{VariantDocument, VariantRecord};
use crate::pipeline::{
    run_serial, BatchError, Pipeline, PipelineError, PipelineOptions, PipelineReport, Sink,
    SkippedBatch, Source,
};
use crate::resolver::StudyResolver;
use crate::store::{DocumentStore, SetupError, SetupGate, StoreConnector};

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Failed to open a store connection: {0}")]
    Connection(#[from] SetupError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

/// Outcome of one load
#[derive(Debug, Clone, Serialize)]
pub struct LoadSummary {
    /// "serial" or "pipelined"
    pub mode: &'static str,
    pub sink_workers: usize,
    pub batches_read: usize,
    pub records_read: usize,
    pub records_written: usize,
    pub documents_written: usize,
    pub skipped: Vec<SkippedBatch>,
    pub elapsed_secs: f64,
}

impl LoadSummary {
    fn new(
        mode: &'static str,
        sink_workers: usize,
        report: PipelineReport,
        documents_written: usize,
        started: Instant,
    ) -> Self {
        Self {
            mode,
            sink_workers,
            batches_read: report.batches_read,
            records_read: report.records_read,
            records_written: report.records_written,
            documents_written,
            skipped: report.skipped,
            elapsed_secs: started.elapsed().as_secs_f64(),
        }
    }

    pub fn skipped_records(&self) -> usize {
        self.skipped.iter().map(|s| s.records).sum()
    }
}

/// Sink that encodes records and bulk-writes them through one store connection
pub struct DocumentSink<St: DocumentStore> {
    worker: usize,
    codec: StudyEntryCodec,
    store: St,
    gate: SetupGate,
    bulk_size: usize,
    ready: bool,
    documents_written: Arc<AtomicUsize>,
}

impl<St: DocumentStore> DocumentSink<St> {
    pub fn new(worker: usize, codec: StudyEntryCodec, store: St, gate: SetupGate, bulk_size: usize) -> Self {
        Self {
            worker,
            codec,
            store,
            gate,
            bulk_size: bulk_size.max(1),
            ready: false,
            documents_written: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Count written documents into a shared counter
    pub fn with_document_counter(mut self, counter: Arc<AtomicUsize>) -> Self {
        self.documents_written = counter;
        self
    }

    /// Encode a batch, merging records that land on the same (variant, study)
    fn encode_batch(&self, batch: &[VariantRecord]) -> Result<Vec<VariantDocument>, MalformedRecordError> {
        let mut documents: Vec<VariantDocument> = Vec::with_capacity(batch.len());
        let mut positions: HashMap<(String, i32), usize> = HashMap::new();

        for record in batch {
            let document = self.codec.encode_record(record)?;
            match positions.get(&document.key()) {
                Some(&i) => documents[i].study.merge(document.study),
                None => {
                    positions.insert(document.key(), documents.len());
                    documents.push(document);
                }
            }
        }
        Ok(documents)
    }
}

#[async_trait]
impl<St: DocumentStore> Sink for DocumentSink<St> {
    type Record = VariantRecord;

    async fn write_batch(&mut self, batch: Vec<VariantRecord>) -> Result<usize, BatchError> {
        let records = batch.len();
        let documents = self.encode_batch(&batch)?;

        if !self.ready {
            self.gate.run_once(self.store.ensure_schema()).await?;
            self.ready = true;
        }

        let mut written = 0;
        let mut documents = documents.into_iter().peekable();
        while documents.peek().is_some() {
            let chunk: Vec<VariantDocument> = documents.by_ref().take(self.bulk_size).collect();
            written += self.store.bulk_write(chunk).await?;
        }

        self.documents_written.fetch_add(written, Ordering::AcqRel);
        debug!(
            "Sink {}: {} records written as {} documents",
            self.worker, records, written
        );
        Ok(records)
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.store.close().await
    }
}

/// Runs loads against one kind of store
pub struct VariantLoader<C: StoreConnector> {
    config: LoadConfig,
    connector: C,
    resolver: Arc<dyn StudyResolver>,
    samples: Arc<dyn SampleCodec>,
    cancel: CancellationToken,
}

impl<C: StoreConnector> VariantLoader<C> {
    pub fn new(config: LoadConfig, connector: C, resolver: Arc<dyn StudyResolver>) -> Self {
        let samples = Arc::new(GroupedGenotypeCodec::new(
            config.default_genotype.clone(),
            config.compress_genotypes,
        ));
        Self {
            config,
            connector,
            resolver,
            samples,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_sample_codec(mut self, samples: Arc<dyn SampleCodec>) -> Self {
        self.samples = samples;
        self
    }

    /// Cancelling this token stops a running load
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &LoadConfig {
        &self.config
    }

    pub async fn load<S>(&self, source: S) -> Result<LoadSummary, LoadError>
    where
        S: Source<Record = VariantRecord>,
    {
        let started = Instant::now();
        let options = PipelineOptions::from(&self.config);
        let gate = SetupGate::new();
        let documents = Arc::new(AtomicUsize::new(0));
        let parallelism = self.config.parallelism();

        if parallelism == 1 {
            info!("Loading serially (parallelism 1)");
            let sink = self.sink(0, &gate, &documents).await?;
            let report = run_serial(source, Vec::new(), sink, &options, self.cancel.clone()).await?;
            return Ok(LoadSummary::new(
                "serial",
                1,
                report,
                documents.load(Ordering::Acquire),
                started,
            ));
        }

        let sink_workers = parallelism - 1;
        info!(
            "Loading with {} transform workers and {} sink workers",
            options.transform_workers, sink_workers
        );
        let mut sinks = Vec::with_capacity(sink_workers);
        for worker in 0..sink_workers {
            sinks.push(self.sink(worker, &gate, &documents).await?);
        }

        let report = Pipeline::new(source, sinks, options)
            .with_cancellation(self.cancel.clone())
            .run()
            .await?;

        Ok(LoadSummary::new(
            "pipelined",
            sink_workers,
            report,
            documents.load(Ordering::Acquire),
            started,
        ))
    }

    /// A sink with its own codec (and so its own name cache) and connection
    async fn sink(
        &self,
        worker: usize,
        gate: &SetupGate,
        documents: &Arc<AtomicUsize>,
    ) -> Result<DocumentSink<C::Store>, LoadError> {
        let codec = StudyEntryCodec::new(
            CodecOptions::from(&self.config),
            self.resolver.clone(),
            self.samples.clone(),
        );
        let store = self.connector.connect().await?;
        Ok(
            DocumentSink::new(worker, codec, store, gate.clone(), self.config.bulk_size())
                .with_document_counter(documents.clone()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FailurePolicy;
    use crate::models::StudyEntry;
    use crate::pipeline::Stage;
    use crate::resolver::StaticStudyResolver;
    use crate::store::{MemoryConnector, MemoryStore};
    use std::time::Duration;

    struct Records {
        records: std::vec::IntoIter<VariantRecord>,
    }

    impl Records {
        fn new(records: Vec<VariantRecord>) -> Self {
            Self {
                records: records.into_iter(),
            }
        }
    }

    #[async_trait]
    impl Source for Records {
        type Record = VariantRecord;

        async fn read_batch(&mut self, max: usize) -> anyhow::Result<Vec<VariantRecord>> {
            Ok(self.records.by_ref().take(max).collect())
        }
    }

    fn record(position: u64, file_id: &str, study_id: &str) -> VariantRecord {
        VariantRecord {
            chromosome: "20".to_string(),
            start: position,
            end: position,
            reference: "G".to_string(),
            alternate: "A".to_string(),
            entry: StudyEntry::new(file_id, study_id)
                .with_attribute("QUAL", "29")
                .with_attribute("ori", format!("sample.vcf:{}", position))
                .with_sample("NA00001", "0|1"),
        }
    }

    fn records(count: u64) -> Vec<VariantRecord> {
        (1..=count).map(|p| record(p, "1", "5")).collect()
    }

    fn loader(config: LoadConfig, store: &MemoryStore) -> VariantLoader<MemoryConnector> {
        VariantLoader::new(
            config,
            MemoryConnector::new(store.clone()),
            Arc::new(StaticStudyResolver::new().with_study(5, "1000g")),
        )
    }

    #[tokio::test]
    async fn test_serial_load() {
        let store = MemoryStore::new();
        let config = LoadConfig {
            batch_size: 10,
            ..LoadConfig::default()
        };

        let summary = loader(config, &store).load(Records::new(records(25))).await.unwrap();

        assert_eq!(summary.mode, "serial");
        assert_eq!(summary.records_read, 25);
        assert_eq!(summary.records_written, 25);
        assert_eq!(summary.documents_written, 25);
        assert_eq!(store.len(), 25);
        assert_eq!(store.setup_count(), 1);

        let stored = store.get("20:7:G:A", 5).unwrap();
        assert_eq!(stored.study.files[0].file_id, 1);
        assert_eq!(stored.study.files[0].origin.as_ref().unwrap().line_index, 7);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pipelined_load_runs_setup_once() {
        // Slow setup: any sink writing before it finished would be rejected
        let store = MemoryStore::with_setup_delay(Duration::from_millis(100));
        let config = LoadConfig {
            batch_size: 20,
            parallelism: 5,
            transform_workers: 2,
            failure_policy: FailurePolicy::Strict,
            ..LoadConfig::default()
        };

        let summary = loader(config, &store).load(Records::new(records(1_000))).await.unwrap();

        assert_eq!(summary.mode, "pipelined");
        assert_eq!(summary.sink_workers, 4);
        assert_eq!(summary.records_written, 1_000);
        assert!(summary.skipped.is_empty());
        assert_eq!(store.len(), 1_000);
        assert_eq!(store.setup_count(), 1);
    }

    #[tokio::test]
    async fn test_setup_failure_aborts_load() {
        let store = MemoryStore::with_setup_failure("permission denied");
        let config = LoadConfig {
            parallelism: 3,
            ..LoadConfig::default()
        };

        let result = loader(config, &store).load(Records::new(records(50))).await;

        assert!(matches!(
            result,
            Err(LoadError::Pipeline(PipelineError::Setup(SetupError::Schema(_))))
        ));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_batches_skipped_when_lenient() {
        let store = MemoryStore::new();
        let mut input = records(30);
        input[12].entry.study_id = "not-a-number".to_string();
        let config = LoadConfig {
            batch_size: 10,
            ..LoadConfig::default()
        };

        let summary = loader(config, &store).load(Records::new(input)).await.unwrap();

        assert_eq!(summary.skipped.len(), 1);
        assert_eq!(summary.skipped[0].stage, Stage::Sink);
        assert_eq!(summary.skipped_records(), 10);
        assert_eq!(summary.records_written, 20);
        assert_eq!(store.len(), 20);
    }

    #[tokio::test]
    async fn test_malformed_batch_fails_when_strict() {
        let store = MemoryStore::new();
        let mut input = records(30);
        input[3].entry.attributes.insert("ori".to_string(), "no-separator".to_string());
        let config = LoadConfig {
            batch_size: 10,
            failure_policy: FailurePolicy::Strict,
            ..LoadConfig::default()
        };

        let result = loader(config, &store).load(Records::new(input)).await;

        assert!(matches!(
            result,
            Err(LoadError::Pipeline(PipelineError::BatchFailed {
                source: BatchError::Malformed(MalformedRecordError::MalformedOrigin(_)),
                ..
            }))
        ));
    }

    #[tokio::test]
    async fn test_files_of_one_variant_merge_into_one_document() {
        let store = MemoryStore::new();
        let input = vec![record(100, "1", "5"), record(100, "2", "5"), record(100, "3", "6")];

        let summary = loader(LoadConfig::default(), &store)
            .load(Records::new(input))
            .await
            .unwrap();

        assert_eq!(summary.documents_written, 2);
        let merged = store.get("20:100:G:A", 5).unwrap();
        let file_ids: Vec<i32> = merged.study.files.iter().map(|f| f.file_id).collect();
        assert_eq!(file_ids, vec![1, 2]);
        assert!(store.get("20:100:G:A", 6).is_some());
    }

    #[tokio::test]
    async fn test_bulk_size_splits_writes() {
        let store = MemoryStore::new();
        let config = LoadConfig {
            batch_size: 10,
            bulk_size: Some(3),
            ..LoadConfig::default()
        };

        loader(config, &store).load(Records::new(records(10))).await.unwrap();

        assert_eq!(store.bulk_write_count(), 4);
        assert_eq!(store.len(), 10);
    }
}
