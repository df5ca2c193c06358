// ==============================================================================
// config.rs - Load Configuration
// ==============================================================================
// Description: Options recognised by the ingestion path and their defaults
// Author: Matt Barham
// Created: 2026-09-28
// Modified: 2026-10-19
// Version: 1.2.0
// ==============================================================================

use serde::{Deserialize, Deserializer, Serialize};
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// What to keep of the raw source line (`src` attribute)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SrcInclusionPolicy {
    /// Drop the raw line entirely
    #[default]
    None,
    /// Keep the first 8 tab-separated columns, gzip-compressed
    #[serde(rename = "FIRST_8_COLUMNS")]
    First8Columns,
    /// Keep the whole line, gzip-compressed
    Full,
}

impl SrcInclusionPolicy {
    /// Lenient parse: anything unrecognised means `None`
    pub fn parse_lenient(value: &str) -> Self {
        match value.parse() {
            Ok(policy) => policy,
            Err(_) => {
                warn!("Invalid src inclusion policy '{}', using NONE", value);
                SrcInclusionPolicy::None
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SrcInclusionPolicy::None => "NONE",
            SrcInclusionPolicy::First8Columns => "FIRST_8_COLUMNS",
            SrcInclusionPolicy::Full => "FULL",
        }
    }
}

impl FromStr for SrcInclusionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().replace('-', "_").as_str() {
            "NONE" => Ok(SrcInclusionPolicy::None),
            "FIRST_8_COLUMNS" => Ok(SrcInclusionPolicy::First8Columns),
            "FULL" => Ok(SrcInclusionPolicy::Full),
            other => Err(format!("unknown src inclusion policy: {}", other)),
        }
    }
}

// Config files get the same leniency as the command line
impl<'de> Deserialize<'de> for SrcInclusionPolicy {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        Ok(SrcInclusionPolicy::parse_lenient(&value))
    }
}

/// What a worker does when a batch cannot be transformed or written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Log the failure, record the batch as skipped and keep going
    #[default]
    Lenient,
    /// Abort the whole run on the first failed batch
    Strict,
}

/// Configuration for one load
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadConfig {
    /// Records per batch moved through the pipeline
    pub batch_size: usize,

    /// Documents per physical write (defaults to `batch_size`)
    pub bulk_size: Option<usize>,

    /// 1 = serial load; P > 1 = pipeline with P - 1 sink workers
    pub parallelism: usize,

    /// Transform-stage workers in pipelined mode
    pub transform_workers: usize,

    /// Capacity (in batches) of each bounded queue
    pub queue_capacity: usize,

    pub src_inclusion: SrcInclusionPolicy,
    pub include_genotypes: bool,
    pub include_stats: bool,
    pub default_genotype: String,
    pub compress_genotypes: bool,

    pub failure_policy: FailurePolicy,

    /// Upper bound on waiting for all workers to finish (seconds)
    pub join_timeout_secs: Option<u64>,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            bulk_size: None,
            parallelism: 1,
            transform_workers: 1,
            queue_capacity: 8,
            src_inclusion: SrcInclusionPolicy::None,
            include_genotypes: true,
            include_stats: false,
            default_genotype: "0/0".to_string(),
            compress_genotypes: true,
            failure_policy: FailurePolicy::Lenient,
            join_timeout_secs: None,
        }
    }
}

impl LoadConfig {
    pub fn batch_size(&self) -> usize {
        self.batch_size.max(1)
    }

    pub fn bulk_size(&self) -> usize {
        self.bulk_size.unwrap_or(self.batch_size).max(1)
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism.max(1)
    }

    pub fn transform_workers(&self) -> usize {
        self.transform_workers.max(1)
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity.max(1)
    }

    pub fn join_timeout(&self) -> Option<Duration> {
        self.join_timeout_secs.map(Duration::from_secs)
    }
}
