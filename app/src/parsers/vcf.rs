// ==============================================================================
// parsers/vcf.rs - VCF record source
// ==============================================================================
// Description: Streams VCF text (plain or gzip) as variant records
// Author: Matt Barham
// Created: 2025-11-03
// Modified: 2026-10-19
// Version: 2.0.1
// ==============================================================================
// References:
// - VCF 4.2 Spec: https://samtools.github.io/hts-specs/VCFv4.2.pdf
// ==============================================================================
// Column mapping:
//   CHROM POS REF      -> record coordinates (end = POS + len(REF) - 1)
//   ALT                -> first allele is the alternate, the rest secondary
//   ID QUAL FILTER     -> attributes "id", "QUAL", "FILTER" (skipped when ".")
//   INFO               -> one attribute per key, flags become "true"
//   FORMAT + samples   -> per-sample field table
//   raw line           -> attribute "src"
//   <file name>:<line> -> attribute "ori"
// ==============================================================================

use async_trait::async_trait;
use flate2::read::MultiGzDecoder;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::codec::attributes::{ORIGIN_KEY, SOURCE_LINE_KEY};
use crate::models::{StudyEntry, VariantRecord};
use crate::pipeline::Source;

/// VCF parsing errors
#[derive(Error, Debug)]
pub enum VCFParseError {
    #[error("Failed to open VCF file: {0}")]
    FileOpenError(String),

    #[error("Failed to read VCF header: {0}")]
    HeaderError(String),

    #[error("Line {line}: expected at least 8 columns, found {found}")]
    TooFewColumns { line: i64, found: usize },

    #[error("Line {line}: invalid position '{value}'")]
    InvalidPosition { line: i64, value: String },

    #[error("Line {line}: {found} sample columns but the header names {expected}")]
    SampleMismatch {
        line: i64,
        expected: usize,
        found: usize,
    },

    #[error("Too many malformed lines ({0})")]
    TooManyErrors(usize),

    #[error("Source has not been opened")]
    NotOpen,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Reads one VCF file for one (file, study) pair
pub struct VcfRecordSource {
    path: PathBuf,
    file_id: String,
    study_id: String,

    /// Partition name used in origin markers (the file name)
    partition: String,

    reader: Option<Box<dyn BufRead + Send>>,

    /// Sample names from the #CHROM header line
    samples: Vec<String>,

    /// Physical line number of the last line read (1-based)
    line_number: i64,

    /// Maximum number of malformed lines skipped before failing
    pub max_errors: usize,

    /// Count of malformed lines skipped so far
    pub error_count: usize,

    /// Count of records produced so far
    pub record_count: usize,
}

impl VcfRecordSource {
    pub fn new(
        path: impl AsRef<Path>,
        file_id: impl Into<String>,
        study_id: impl Into<String>,
    ) -> Self {
        let path = path.as_ref().to_path_buf();
        let partition = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        Self {
            path,
            file_id: file_id.into(),
            study_id: study_id.into(),
            partition,
            reader: None,
            samples: Vec::new(),
            line_number: 0,
            max_errors: 1000,
            error_count: 0,
            record_count: 0,
        }
    }

    /// Set maximum allowed malformed lines
    pub fn with_max_errors(mut self, max: usize) -> Self {
        self.max_errors = max;
        self
    }

    /// Sample names found in the header (available after `open`)
    pub fn samples(&self) -> &[String] {
        &self.samples
    }

    /// Open the file and consume the header, up to and including #CHROM
    fn open_reader(&mut self) -> Result<(), VCFParseError> {
        let file = File::open(&self.path)
            .map_err(|e| VCFParseError::FileOpenError(format!("{}: {}", self.path.display(), e)))?;

        let gzipped = self
            .path
            .extension()
            .map_or(false, |ext| ext.eq_ignore_ascii_case("gz"));
        let mut reader: Box<dyn BufRead + Send> = if gzipped {
            Box::new(BufReader::new(MultiGzDecoder::new(file)))
        } else {
            Box::new(BufReader::new(file))
        };

        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line)? == 0 {
                return Err(VCFParseError::HeaderError(
                    "end of file before #CHROM line".to_string(),
                ));
            }
            self.line_number += 1;

            let trimmed = line.trim_end_matches(['\n', '\r']);
            if trimmed.starts_with("##") {
                continue;
            }
            if trimmed.starts_with("#CHROM") {
                self.samples = trimmed.split('\t').skip(9).map(str::to_string).collect();
                break;
            }
            return Err(VCFParseError::HeaderError(format!(
                "line {} precedes the #CHROM header",
                self.line_number
            )));
        }

        info!(
            "Opened {} ({} samples, gzip: {})",
            self.path.display(),
            self.samples.len(),
            gzipped
        );
        self.reader = Some(reader);
        Ok(())
    }

    /// Next non-empty data line, or `None` at end of file
    fn next_line(&mut self) -> Result<Option<String>, VCFParseError> {
        let reader = self.reader.as_mut().ok_or(VCFParseError::NotOpen)?;
        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line)? == 0 {
                return Ok(None);
            }
            self.line_number += 1;
            let trimmed = line.trim_end_matches(['\n', '\r']);
            if !trimmed.is_empty() {
                return Ok(Some(trimmed.to_string()));
            }
        }
    }

    /// Parse one data line into a record
    fn parse_line(&self, line: &str) -> Result<VariantRecord, VCFParseError> {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 8 {
            return Err(VCFParseError::TooFewColumns {
                line: self.line_number,
                found: fields.len(),
            });
        }

        let start: u64 = fields[1].parse().map_err(|_| VCFParseError::InvalidPosition {
            line: self.line_number,
            value: fields[1].to_string(),
        })?;
        let reference = fields[3].to_string();
        let end = start.saturating_add((reference.len() as u64).saturating_sub(1));

        let mut alternates = fields[4].split(',').map(str::to_string);
        let alternate = alternates.next().unwrap_or_default();

        let mut entry = StudyEntry::new(self.file_id.clone(), self.study_id.clone());
        entry.secondary_alternates = alternates.collect();

        for (key, value) in [("id", fields[2]), ("QUAL", fields[5]), ("FILTER", fields[6])] {
            if value != "." {
                entry.attributes.insert(key.to_string(), value.to_string());
            }
        }
        if fields[7] != "." {
            for item in fields[7].split(';').filter(|item| !item.is_empty()) {
                let (key, value) = item.split_once('=').unwrap_or((item, "true"));
                entry.attributes.insert(key.to_string(), value.to_string());
            }
        }
        entry
            .attributes
            .insert(SOURCE_LINE_KEY.to_string(), line.to_string());
        entry.attributes.insert(
            ORIGIN_KEY.to_string(),
            format!("{}:{}", self.partition, self.line_number),
        );

        if fields.len() > 9 {
            let columns = &fields[9..];
            if columns.len() != self.samples.len() {
                return Err(VCFParseError::SampleMismatch {
                    line: self.line_number,
                    expected: self.samples.len(),
                    found: columns.len(),
                });
            }
            let keys: Vec<&str> = fields[8].split(':').collect();
            for (sample, column) in self.samples.iter().zip(columns) {
                let values: BTreeMap<String, String> = keys
                    .iter()
                    .zip(column.split(':'))
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect();
                entry.samples.insert(sample.clone(), values);
            }
        }

        Ok(VariantRecord {
            chromosome: fields[0].to_string(),
            start,
            end,
            reference,
            alternate,
            entry,
        })
    }
}

#[async_trait]
impl Source for VcfRecordSource {
    type Record = VariantRecord;

    async fn open(&mut self) -> anyhow::Result<()> {
        self.open_reader()?;
        Ok(())
    }

    async fn read_batch(&mut self, max: usize) -> anyhow::Result<Vec<VariantRecord>> {
        let mut batch = Vec::with_capacity(max);

        while batch.len() < max {
            let line = match self.next_line()? {
                Some(line) => line,
                None => break,
            };

            match self.parse_line(&line) {
                Ok(record) => batch.push(record),
                Err(e) => {
                    warn!("Skipping malformed VCF line: {}", e);
                    self.error_count += 1;
                    if self.error_count > self.max_errors {
                        return Err(VCFParseError::TooManyErrors(self.error_count).into());
                    }
                }
            }
        }

        self.record_count += batch.len();
        Ok(batch)
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        if self.reader.take().is_some() {
            debug!(
                "Closed {}: {} records, {} malformed lines",
                self.path.display(),
                self.record_count,
                self.error_count
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tempfile::TempDir;

    const VCF: &str = "##fileformat=VCFv4.2\n\
##INFO=<ID=DP,Number=1,Type=Integer,Description=\"Total Depth\">\n\
#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT\tNA00001\tNA00002\n\
20\t14370\trs6054257\tG\tA\t29\tPASS\tNS=3;DP=14;AF=0.5;DB\tGT:GQ\t0|0:48\t1|0:48\n\
20\t17330\t.\tT\tA,C\t3\tq10\tDP=11\tGT:GQ\t0|1:3\t0/0:41\n\
\n\
20\t1110696\trs6040355\tAC\tG\t.\t.\t.\tGT\t1|2\t./.\n";

    fn write_vcf(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[tokio::test]
    async fn test_reads_records_in_batches() {
        let dir = TempDir::new().unwrap();
        let path = write_vcf(&dir, "calls.vcf", VCF);
        let mut source = VcfRecordSource::new(&path, "3", "1");
        source.open().await.unwrap();

        assert_eq!(source.samples(), ["NA00001", "NA00002"]);

        let first = source.read_batch(2).await.unwrap();
        let second = source.read_batch(2).await.unwrap();
        let third = source.read_batch(2).await.unwrap();

        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 1);
        assert!(third.is_empty());
        assert_eq!(source.record_count, 3);
    }

    #[tokio::test]
    async fn test_maps_columns_to_record() {
        let dir = TempDir::new().unwrap();
        let path = write_vcf(&dir, "calls.vcf", VCF);
        let mut source = VcfRecordSource::new(&path, "3", "1");
        source.open().await.unwrap();
        let records = source.read_batch(10).await.unwrap();

        let first = &records[0];
        assert_eq!(first.variant_id(), "20:14370:G:A");
        assert_eq!(first.entry.file_id.as_deref(), Some("3"));
        assert_eq!(first.entry.study_id, "1");
        assert_eq!(first.entry.attributes["id"], "rs6054257");
        assert_eq!(first.entry.attributes["QUAL"], "29");
        assert_eq!(first.entry.attributes["FILTER"], "PASS");
        assert_eq!(first.entry.attributes["DP"], "14");
        assert_eq!(first.entry.attributes["DB"], "true");
        assert_eq!(first.entry.attributes["ori"], "calls.vcf:4");
        assert!(first.entry.attributes["src"].starts_with("20\t14370\trs6054257"));
        assert_eq!(first.entry.samples["NA00002"]["GT"], "1|0");
        assert_eq!(first.entry.samples["NA00002"]["GQ"], "48");

        let multi = &records[1];
        assert_eq!(multi.alternate, "A");
        assert_eq!(multi.entry.secondary_alternates, vec!["C".to_string()]);
        assert!(!multi.entry.attributes.contains_key("id"));

        // Blank line 6 is skipped but still counted
        let deletion = &records[2];
        assert_eq!(deletion.start, 1110696);
        assert_eq!(deletion.end, 1110697);
        assert_eq!(deletion.entry.attributes["ori"], "calls.vcf:7");
        assert!(!deletion.entry.attributes.contains_key("QUAL"));
        assert_eq!(deletion.entry.samples["NA00002"]["GT"], "./.");
    }

    #[tokio::test]
    async fn test_reads_gzip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("calls.vcf.gz");
        let mut encoder = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        encoder.write_all(VCF.as_bytes()).unwrap();
        encoder.finish().unwrap();

        let mut source = VcfRecordSource::new(&path, "3", "1");
        source.open().await.unwrap();
        let records = source.read_batch(10).await.unwrap();

        assert_eq!(records.len(), 3);
        assert_eq!(records[0].entry.attributes["ori"], "calls.vcf.gz:4");
    }

    #[tokio::test]
    async fn test_skips_malformed_lines_up_to_limit() {
        let dir = TempDir::new().unwrap();
        let content = format!("{}20\tnot-a-position\t.\tA\tG\t.\t.\t.\n20\t5\n", VCF);
        let path = write_vcf(&dir, "bad.vcf", &content);

        let mut lenient = VcfRecordSource::new(&path, "3", "1").with_max_errors(2);
        lenient.open().await.unwrap();
        assert_eq!(lenient.read_batch(10).await.unwrap().len(), 3);
        assert_eq!(lenient.error_count, 2);

        let mut strict = VcfRecordSource::new(&path, "3", "1").with_max_errors(1);
        strict.open().await.unwrap();
        assert!(strict.read_batch(10).await.is_err());
    }

    #[tokio::test]
    async fn test_end_saturates_at_maximum_position() {
        let dir = TempDir::new().unwrap();
        let content = format!("{}20\t{}\t.\tACGT\tA\t.\t.\t.\n", VCF, u64::MAX);
        let path = write_vcf(&dir, "edge.vcf", &content);

        let mut source = VcfRecordSource::new(&path, "3", "1");
        source.open().await.unwrap();
        let records = source.read_batch(10).await.unwrap();

        assert_eq!(records.len(), 4);
        assert_eq!(records[3].start, u64::MAX);
        assert_eq!(records[3].end, u64::MAX);
    }

    #[tokio::test]
    async fn test_missing_header() {
        let dir = TempDir::new().unwrap();
        let path = write_vcf(&dir, "headless.vcf", "20\t14370\t.\tG\tA\t.\t.\t.\n");

        let mut source = VcfRecordSource::new(&path, "3", "1");
        let error = source.open().await.unwrap_err();
        assert!(matches!(
            error.downcast_ref::<VCFParseError>(),
            Some(VCFParseError::HeaderError(_))
        ));
    }

    #[tokio::test]
    async fn test_read_before_open() {
        let mut source = VcfRecordSource::new("/nonexistent.vcf", "3", "1");
        assert!(source.read_batch(1).await.is_err());
    }
}
