// ==============================================================================
// parsers/mod.rs - Record source modules
// ==============================================================================
// Description: Sources that turn variant files into pipeline records
// Author: Matt Barham
// Created: 2025-11-03
// Modified: 2026-10-14
// Version: 2.0.0
// ==============================================================================

pub mod vcf;

pub use vcf::{VCFParseError, VcfRecordSource};
