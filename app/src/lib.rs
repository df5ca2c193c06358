// ==============================================================================
// lib.rs - Variant Loader Library
// ==============================================================================
// Description: Library interface for the variant ingestion modules
// Author: Matt Barham
// Created: 2025-11-03
// Modified: 2026-10-17
// Version: 2.0.0
// ==============================================================================

pub mod audit;
pub mod codec;
pub mod config;
pub mod loader;
pub mod models;
pub mod parsers;
pub mod pipeline;
pub mod resolver;
pub mod store;

pub use config::{FailurePolicy, LoadConfig, SrcInclusionPolicy};
pub use loader::{LoadError, LoadSummary, VariantLoader};
