//! SQLite [`SchemaStore`] backend built on sqlx.
//!
//! Schema documents are stored as JSON alongside a bare `version` column
//! used for the compare-and-swap write. Records, history, and the
//! ingestion log are append-only tables.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::models::{
    CanonicalRecord, FieldMap, IngestionLogEntry, PipelineError, SchemaDocument,
    SchemaHistoryEntry, ShapeKind,
};

use super::SchemaStore;

/// SQLite-backed store.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn store_err(e: impl std::fmt::Display) -> PipelineError {
    PipelineError::StoreUnavailable(e.to_string())
}

#[async_trait]
impl SchemaStore for SqliteStore {
    async fn get_schema(&self, source_id: &str) -> Result<Option<SchemaDocument>, PipelineError> {
        let row: Option<String> =
            sqlx::query_scalar("SELECT document FROM schemas WHERE source_id = ?")
                .bind(source_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(store_err)?;
        match row {
            Some(raw) => Ok(Some(serde_json::from_str(&raw).map_err(store_err)?)),
            None => Ok(None),
        }
    }

    async fn put_schema(
        &self,
        doc: &SchemaDocument,
        expected_version: u64,
    ) -> Result<(), PipelineError> {
        let encoded = serde_json::to_string(doc).map_err(store_err)?;

        let affected = if expected_version == 0 {
            sqlx::query(
                "INSERT INTO schemas (source_id, version, document) VALUES (?, ?, ?)
                 ON CONFLICT(source_id) DO NOTHING",
            )
            .bind(&doc.source_id)
            .bind(doc.version as i64)
            .bind(&encoded)
            .execute(&self.pool)
            .await
            .map_err(store_err)?
            .rows_affected()
        } else {
            sqlx::query(
                "UPDATE schemas SET version = ?, document = ? WHERE source_id = ? AND version = ?",
            )
            .bind(doc.version as i64)
            .bind(&encoded)
            .bind(&doc.source_id)
            .bind(expected_version as i64)
            .execute(&self.pool)
            .await
            .map_err(store_err)?
            .rows_affected()
        };

        if affected == 0 {
            return Err(PipelineError::SchemaConflict {
                source_id: doc.source_id.clone(),
                expected: expected_version,
            });
        }
        Ok(())
    }

    async fn append_history(
        &self,
        source_id: &str,
        entry: &SchemaHistoryEntry,
    ) -> Result<(), PipelineError> {
        let encoded = serde_json::to_string(entry).map_err(store_err)?;
        sqlx::query("INSERT INTO schema_history (source_id, version, entry) VALUES (?, ?, ?)")
            .bind(source_id)
            .bind(entry.version as i64)
            .bind(&encoded)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn get_history(&self, source_id: &str) -> Result<Vec<SchemaHistoryEntry>, PipelineError> {
        let rows = sqlx::query(
            "SELECT entry FROM schema_history WHERE source_id = ? ORDER BY version ASC",
        )
        .bind(source_id)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        rows.into_iter()
            .map(|row| {
                let raw: String = row.get(0);
                serde_json::from_str(&raw).map_err(store_err)
            })
            .collect()
    }

    async fn insert_records(
        &self,
        source_id: &str,
        shape: ShapeKind,
        records: &[CanonicalRecord],
    ) -> Result<(), PipelineError> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await.map_err(store_err)?;
        for record in records {
            let data = serde_json::to_string(&record.fields).map_err(store_err)?;
            sqlx::query(
                "INSERT INTO records (id, source_id, shape, data, content_hash, ingested_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(Uuid::new_v4().to_string())
            .bind(source_id)
            .bind(shape.as_str())
            .bind(&data)
            .bind(&record.hash)
            .bind(&now)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;
        }
        tx.commit().await.map_err(store_err)?;
        Ok(())
    }

    async fn get_records(
        &self,
        source_id: &str,
        shape: ShapeKind,
        limit: Option<usize>,
    ) -> Result<Vec<FieldMap>, PipelineError> {
        let limit = limit.map(|n| n as i64).unwrap_or(i64::MAX);
        let rows = sqlx::query(
            "SELECT data FROM records WHERE source_id = ? AND shape = ? ORDER BY rowid ASC LIMIT ?",
        )
        .bind(source_id)
        .bind(shape.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        rows.into_iter()
            .map(|row| {
                let raw: String = row.get(0);
                serde_json::from_str(&raw).map_err(store_err)
            })
            .collect()
    }

    async fn append_ingestion_log(&self, entry: &IngestionLogEntry) -> Result<(), PipelineError> {
        let encoded = serde_json::to_string(entry).map_err(store_err)?;
        sqlx::query("INSERT INTO ingestion_log (source_id, entry, timestamp) VALUES (?, ?, ?)")
            .bind(&entry.source_id)
            .bind(&encoded)
            .bind(entry.timestamp.to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn get_ingestion_log(
        &self,
        source_id: &str,
    ) -> Result<Vec<IngestionLogEntry>, PipelineError> {
        let rows = sqlx::query(
            "SELECT entry FROM ingestion_log WHERE source_id = ? ORDER BY rowid DESC",
        )
        .bind(source_id)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        rows.into_iter()
            .map(|row| {
                let raw: String = row.get(0);
                serde_json::from_str(&raw).map_err(store_err)
            })
            .collect()
    }
}
