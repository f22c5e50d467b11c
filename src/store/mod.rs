//! Storage abstraction for Schemaflow.
//!
//! The [`SchemaStore`] trait defines all persistence operations the
//! pipeline needs, enabling pluggable backends (SQLite, in-memory).
//! Schema documents are an arena keyed by source identity: the in-process
//! representation is a value fetched and written back explicitly, never a
//! shared mutable global.
//!
//! Writes use a versioned compare-and-swap: [`SchemaStore::put_schema`]
//! succeeds only when the stored version still matches `expected_version`
//! (`0` means "insert, the source must not exist yet"). This is the
//! serialization primitive that keeps two concurrent ingestions for one
//! source from both committing version N+1.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;

use crate::models::{
    CanonicalRecord, FieldMap, IngestionLogEntry, PipelineError, SchemaDocument,
    SchemaHistoryEntry, ShapeKind,
};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Abstract document store for schemas, records, history, and the
/// ingestion log.
#[async_trait]
pub trait SchemaStore: Send + Sync {
    /// Fetch the schema document for a source, if any.
    async fn get_schema(&self, source_id: &str) -> Result<Option<SchemaDocument>, PipelineError>;

    /// Persist a schema document if and only if the stored version still
    /// equals `expected_version` (0 = the source must be absent).
    ///
    /// # Errors
    ///
    /// [`PipelineError::SchemaConflict`] when a concurrent writer won the
    /// race; [`PipelineError::StoreUnavailable`] on backend failure.
    async fn put_schema(
        &self,
        doc: &SchemaDocument,
        expected_version: u64,
    ) -> Result<(), PipelineError>;

    /// Append one immutable history entry for a source.
    async fn append_history(
        &self,
        source_id: &str,
        entry: &SchemaHistoryEntry,
    ) -> Result<(), PipelineError>;

    /// All history entries for a source, in version order.
    async fn get_history(&self, source_id: &str) -> Result<Vec<SchemaHistoryEntry>, PipelineError>;

    /// Persist canonical records for one source and shape.
    async fn insert_records(
        &self,
        source_id: &str,
        shape: ShapeKind,
        records: &[CanonicalRecord],
    ) -> Result<(), PipelineError>;

    /// Stored records for one source and shape, in insertion order.
    async fn get_records(
        &self,
        source_id: &str,
        shape: ShapeKind,
        limit: Option<usize>,
    ) -> Result<Vec<FieldMap>, PipelineError>;

    /// Append one ingestion log row.
    async fn append_ingestion_log(&self, entry: &IngestionLogEntry) -> Result<(), PipelineError>;

    /// Ingestion log rows for a source, newest first.
    async fn get_ingestion_log(
        &self,
        source_id: &str,
    ) -> Result<Vec<IngestionLogEntry>, PipelineError>;
}
