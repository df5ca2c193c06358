// ==============================================================================
// store/mod.rs - Document Store Contract
// ==============================================================================
// Description: Bulk-write interface for encoded variant documents
// Author: Matt Barham
// Created: 2026-10-04
// Modified: 2026-10-15
// Version: 1.1.0
// ==============================================================================

pub mod memory;
pub mod postgres;
pub mod setup;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::VariantDocument;

pub use memory::{MemoryConnector, MemoryStore};
pub use postgres::{PgConnector, PgDocumentStore};
pub use setup::SetupGate;

/// One-time store preparation failed. Always fatal for a load.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SetupError {
    #[error("Failed to connect to document store: {0}")]
    Connection(String),

    #[error("Failed to prepare document schema: {0}")]
    Schema(String),
}

/// A bulk write could not be persisted
#[derive(Error, Debug)]
pub enum WriteError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Stored document {id} for study {study_id} is unreadable: {details}")]
    CorruptDocument {
        id: String,
        study_id: i32,
        details: String,
    },

    #[error("Document {id} rejected: {reason}")]
    Rejected { id: String, reason: String },
}

/// One connection to a document store, owned by exactly one sink worker
#[async_trait]
pub trait DocumentStore: Send + 'static {
    /// Idempotent preparation (tables, indexes). Run once per load via [`SetupGate`].
    async fn ensure_schema(&mut self) -> Result<(), SetupError>;

    /// Merge each document into whatever is stored under its key.
    /// Returns the number of documents written.
    async fn bulk_write(&mut self, documents: Vec<VariantDocument>) -> Result<usize, WriteError>;

    async fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Hands out one store connection per sink worker
#[async_trait]
pub trait StoreConnector: Send + Sync {
    type Store: DocumentStore;

    async fn connect(&self) -> Result<Self::Store, SetupError>;
}
