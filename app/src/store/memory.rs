// ==============================================================================
// store/memory.rs - In-Memory Document Store
// ==============================================================================
// Description: Process-local store used for dry runs and tests
// Author: Matt Barham
// Created: 2026-10-05
// Modified: 2026-10-15
// Version: 1.1.0
// ==============================================================================

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

use super::{DocumentStore, SetupError, StoreConnector, WriteError};
use crate::models::VariantDocument;

type Documents = BTreeMap<(String, i32), VariantDocument>;

/// Clones share the same documents and counters
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    documents: Mutex<Documents>,
    setups: AtomicUsize,
    bulk_writes: AtomicUsize,
    setup_delay: Option<Duration>,
    setup_failure: Option<String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every setup take at least `delay`
    pub fn with_setup_delay(delay: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                setup_delay: Some(delay),
                ..Inner::default()
            }),
        }
    }

    /// Make setup fail with `reason`
    pub fn with_setup_failure(reason: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                setup_failure: Some(reason.into()),
                ..Inner::default()
            }),
        }
    }

    pub fn get(&self, variant_id: &str, study_id: i32) -> Option<VariantDocument> {
        self.lock()
            .get(&(variant_id.to_string(), study_id))
            .cloned()
    }

    /// All documents in key order
    pub fn documents(&self) -> Vec<VariantDocument> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn setup_count(&self) -> usize {
        self.inner.setups.load(Ordering::SeqCst)
    }

    pub fn bulk_write_count(&self) -> usize {
        self.inner.bulk_writes.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, Documents> {
        // A poisoned map is still structurally valid
        self.inner
            .documents
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn ensure_schema(&mut self) -> Result<(), SetupError> {
        if let Some(delay) = self.inner.setup_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(reason) = &self.inner.setup_failure {
            return Err(SetupError::Schema(reason.clone()));
        }
        self.inner.setups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn bulk_write(&mut self, documents: Vec<VariantDocument>) -> Result<usize, WriteError> {
        // Behave like a store whose collection does not exist yet
        if self.inner.setups.load(Ordering::SeqCst) == 0 {
            let id = documents.first().map(|d| d.id.clone()).unwrap_or_default();
            return Err(WriteError::Rejected {
                id,
                reason: "schema has not been created".to_string(),
            });
        }

        let written = documents.len();
        let mut stored = self.lock();
        for document in documents {
            match stored.get_mut(&document.key()) {
                Some(existing) => existing.study.merge(document.study),
                None => {
                    stored.insert(document.key(), document);
                }
            }
        }
        drop(stored);

        self.inner.bulk_writes.fetch_add(1, Ordering::SeqCst);
        debug!("Memory store wrote {} documents", written);
        Ok(written)
    }
}

/// Connector whose connections all share one [`MemoryStore`]
#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    store: MemoryStore,
}

impl MemoryConnector {
    pub fn new(store: MemoryStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }
}

#[async_trait]
impl StoreConnector for MemoryConnector {
    type Store = MemoryStore;

    async fn connect(&self) -> Result<MemoryStore, SetupError> {
        Ok(self.store.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EncodedDocument, FileDocument};

    fn document(id: &str, study_id: i32, file_id: i32) -> VariantDocument {
        VariantDocument {
            id: id.to_string(),
            chromosome: "1".to_string(),
            start: 100,
            end: 100,
            reference: "A".to_string(),
            alternate: "T".to_string(),
            study: EncodedDocument {
                study_id,
                files: vec![FileDocument {
                    file_id,
                    alternates: None,
                    attributes: None,
                    origin: None,
                }],
                genotypes: None,
                stats: None,
            },
        }
    }

    #[tokio::test]
    async fn test_write_before_setup_is_rejected() {
        let mut store = MemoryStore::new();
        let result = store.bulk_write(vec![document("1:100:A:T", 1, 1)]).await;
        assert!(matches!(result, Err(WriteError::Rejected { .. })));
    }

    #[tokio::test]
    async fn test_documents_merge_by_key() {
        let mut store = MemoryStore::new();
        store.ensure_schema().await.unwrap();

        store
            .bulk_write(vec![document("1:100:A:T", 1, 1), document("1:100:A:T", 2, 1)])
            .await
            .unwrap();
        store
            .bulk_write(vec![document("1:100:A:T", 1, 7)])
            .await
            .unwrap();

        assert_eq!(store.len(), 2);
        assert_eq!(store.bulk_write_count(), 2);
        let merged = store.get("1:100:A:T", 1).unwrap();
        let file_ids: Vec<i32> = merged.study.files.iter().map(|f| f.file_id).collect();
        assert_eq!(file_ids, vec![1, 7]);
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let store = MemoryStore::new();
        let mut connection = MemoryConnector::new(store.clone()).connect().await.unwrap();
        connection.ensure_schema().await.unwrap();

        assert_eq!(store.setup_count(), 1);
    }

    #[tokio::test]
    async fn test_setup_failure() {
        let mut store = MemoryStore::with_setup_failure("read-only");
        assert_eq!(
            store.ensure_schema().await,
            Err(SetupError::Schema("read-only".to_string()))
        );
    }
}
