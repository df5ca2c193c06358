// ==============================================================================
// codec/mod.rs - Variant Record Codec
// ==============================================================================
// Description: Study entry <-> compact document transformation (no I/O)
// Author: Matt Barham
// Created: 2026-09-29
// Modified: 2026-10-15
// Version: 1.2.0
// ==============================================================================

pub mod attributes;
pub mod keys;
pub mod samples;
pub mod stats;
pub mod study_entry;

use thiserror::Error;

pub use samples::{GroupedGenotypeCodec, SampleCodec};
pub use study_entry::{CodecOptions, StudyEntryCodec};

/// A record or document the codec cannot turn into the other form
#[derive(Error, Debug)]
pub enum MalformedRecordError {
    #[error("Invalid {field} identifier: '{value}'")]
    InvalidIdentifier { field: &'static str, value: String },

    #[error("Malformed origin marker '{0}' (expected <partition>:<lineIndex>)")]
    MalformedOrigin(String),

    #[error("Cannot restore source line: {0}")]
    CorruptSourceLine(String),

    #[error("Invalid genotype payload: {0}")]
    InvalidGenotypes(String),

    #[error("Compression error: {0}")]
    Compression(#[from] std::io::Error),
}
