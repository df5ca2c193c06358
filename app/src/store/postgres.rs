// ==============================================================================
// store/postgres.rs - PostgreSQL Document Store
// ==============================================================================
// Description: Variant documents as JSONB rows keyed by (variant, study)
// Author: Matt Barham
// Created: 2026-10-05
// Modified: 2026-10-19
// Version: 1.2.0
// ==============================================================================
// Each bulk write is one transaction. Rows are locked with a transaction-scoped
// advisory lock before the read-merge-upsert so that concurrent sink workers
// writing the same variant never lose each other's file sub-documents.
// ==============================================================================

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{Connection, PgPool, Postgres};
use tracing::{debug, info};

use super::{DocumentStore, SetupError, StoreConnector, WriteError};
use crate::models::VariantDocument;

const CREATE_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS variant_documents (
        variant_id      TEXT        NOT NULL,
        study_id        INTEGER     NOT NULL,
        chromosome      TEXT        NOT NULL,
        start_position  BIGINT      NOT NULL,
        document        JSONB       NOT NULL,
        updated_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (variant_id, study_id)
    )
"#;

const CREATE_INDEX: &str = r#"
    CREATE INDEX IF NOT EXISTS variant_documents_position_idx
        ON variant_documents (chromosome, start_position)
"#;

/// One pooled connection owned by one sink worker
pub struct PgDocumentStore {
    conn: PoolConnection<Postgres>,
}

impl PgDocumentStore {
    pub fn new(conn: PoolConnection<Postgres>) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn ensure_schema(&mut self) -> Result<(), SetupError> {
        for statement in [CREATE_TABLE, CREATE_INDEX] {
            sqlx::query(statement)
                .execute(&mut *self.conn)
                .await
                .map_err(|e| SetupError::Schema(e.to_string()))?;
        }
        info!("Variant document schema ready");
        Ok(())
    }

    async fn bulk_write(&mut self, documents: Vec<VariantDocument>) -> Result<usize, WriteError> {
        let documents = lock_order(documents);
        let written = documents.len();
        let mut tx = self.conn.begin().await?;

        for document in documents {
            let (id, study_id) = document.key();

            sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1), $2)")
                .bind(&id)
                .bind(study_id)
                .execute(&mut *tx)
                .await?;

            let stored: Option<(Json<VariantDocument>,)> = sqlx::query_as(
                "SELECT document FROM variant_documents WHERE variant_id = $1 AND study_id = $2",
            )
            .bind(&id)
            .bind(study_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| match e {
                sqlx::Error::ColumnDecode { source, .. } => WriteError::CorruptDocument {
                    id: id.clone(),
                    study_id,
                    details: source.to_string(),
                },
                other => WriteError::Database(other),
            })?;

            let merged = match stored {
                Some((Json(mut existing),)) => {
                    existing.study.merge(document.study);
                    existing
                }
                None => document,
            };

            let start = i64::try_from(merged.start).map_err(|_| WriteError::Rejected {
                id: id.clone(),
                reason: format!("start position {} out of range", merged.start),
            })?;

            sqlx::query(
                r#"
                INSERT INTO variant_documents (variant_id, study_id, chromosome, start_position, document, updated_at)
                VALUES ($1, $2, $3, $4, $5, NOW())
                ON CONFLICT (variant_id, study_id)
                DO UPDATE SET document = EXCLUDED.document, updated_at = NOW()
                "#,
            )
            .bind(&id)
            .bind(study_id)
            .bind(&merged.chromosome)
            .bind(start)
            .bind(Json(&merged))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!("Committed {} variant documents", written);
        Ok(written)
    }
}

/// Sort by (variant, study) so concurrent writers take advisory locks in the same order
fn lock_order(mut documents: Vec<VariantDocument>) -> Vec<VariantDocument> {
    documents.sort_by_cached_key(|document| document.key());
    documents
}

/// Hands each sink worker its own connection from a shared pool
#[derive(Clone)]
pub struct PgConnector {
    pool: PgPool,
}

impl PgConnector {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Pool sized for `connections` concurrent sink workers plus the audit writer
    pub async fn connect_url(database_url: &str, connections: u32) -> Result<Self, SetupError> {
        let pool = PgPoolOptions::new()
            .max_connections(connections + 1)
            .connect(database_url)
            .await
            .map_err(|e| SetupError::Connection(e.to_string()))?;
        info!("Connected to database");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl StoreConnector for PgConnector {
    type Store = PgDocumentStore;

    async fn connect(&self) -> Result<PgDocumentStore, SetupError> {
        let conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| SetupError::Connection(e.to_string()))?;
        Ok(PgDocumentStore::new(conn))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EncodedDocument;

    fn document(id: &str, study_id: i32) -> VariantDocument {
        VariantDocument {
            id: id.to_string(),
            chromosome: "1".to_string(),
            start: 100,
            end: 100,
            reference: "A".to_string(),
            alternate: "T".to_string(),
            study: EncodedDocument {
                study_id,
                files: Vec::new(),
                genotypes: None,
                stats: None,
            },
        }
    }

    #[test]
    fn test_lock_order_ignores_input_order() {
        let forward = vec![
            document("1:100:A:T", 2),
            document("1:100:A:T", 1),
            document("2:500:G:C", 1),
            document("1:200:C:G", 1),
        ];
        let mut backward = forward.clone();
        backward.reverse();

        let keys = |documents: Vec<VariantDocument>| {
            lock_order(documents)
                .iter()
                .map(VariantDocument::key)
                .collect::<Vec<_>>()
        };

        let expected = vec![
            ("1:100:A:T".to_string(), 1),
            ("1:100:A:T".to_string(), 2),
            ("1:200:C:G".to_string(), 1),
            ("2:500:G:C".to_string(), 1),
        ];
        assert_eq!(keys(forward), expected);
        assert_eq!(keys(backward), expected);
    }
}
