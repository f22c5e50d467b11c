//! In-memory [`SchemaStore`] implementation for testing and embedding.
//!
//! Uses `HashMap` and `Vec` behind `std::sync::RwLock` for thread safety.
//! Compare-and-swap semantics match the SQLite backend exactly, so the
//! orchestrator's conflict handling can be exercised without a database.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::models::{
    CanonicalRecord, FieldMap, IngestionLogEntry, PipelineError, SchemaDocument,
    SchemaHistoryEntry, ShapeKind,
};

use super::SchemaStore;

/// In-memory store for tests and single-process embedding.
#[derive(Default)]
pub struct MemoryStore {
    schemas: RwLock<HashMap<String, SchemaDocument>>,
    histories: RwLock<HashMap<String, Vec<SchemaHistoryEntry>>>,
    records: RwLock<HashMap<(String, ShapeKind), Vec<FieldMap>>>,
    logs: RwLock<HashMap<String, Vec<IngestionLogEntry>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SchemaStore for MemoryStore {
    async fn get_schema(&self, source_id: &str) -> Result<Option<SchemaDocument>, PipelineError> {
        let schemas = self.schemas.read().expect("schemas lock poisoned");
        Ok(schemas.get(source_id).cloned())
    }

    async fn put_schema(
        &self,
        doc: &SchemaDocument,
        expected_version: u64,
    ) -> Result<(), PipelineError> {
        let mut schemas = self.schemas.write().expect("schemas lock poisoned");
        let current = schemas.get(&doc.source_id).map(|d| d.version).unwrap_or(0);
        if current != expected_version {
            return Err(PipelineError::SchemaConflict {
                source_id: doc.source_id.clone(),
                expected: expected_version,
            });
        }
        schemas.insert(doc.source_id.clone(), doc.clone());
        Ok(())
    }

    async fn append_history(
        &self,
        source_id: &str,
        entry: &SchemaHistoryEntry,
    ) -> Result<(), PipelineError> {
        let mut histories = self.histories.write().expect("histories lock poisoned");
        histories
            .entry(source_id.to_string())
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    async fn get_history(&self, source_id: &str) -> Result<Vec<SchemaHistoryEntry>, PipelineError> {
        let histories = self.histories.read().expect("histories lock poisoned");
        Ok(histories.get(source_id).cloned().unwrap_or_default())
    }

    async fn insert_records(
        &self,
        source_id: &str,
        shape: ShapeKind,
        records: &[CanonicalRecord],
    ) -> Result<(), PipelineError> {
        let mut stored = self.records.write().expect("records lock poisoned");
        let slot = stored.entry((source_id.to_string(), shape)).or_default();
        for record in records {
            slot.push(record.fields.clone());
        }
        Ok(())
    }

    async fn get_records(
        &self,
        source_id: &str,
        shape: ShapeKind,
        limit: Option<usize>,
    ) -> Result<Vec<FieldMap>, PipelineError> {
        let stored = self.records.read().expect("records lock poisoned");
        let all = stored
            .get(&(source_id.to_string(), shape))
            .cloned()
            .unwrap_or_default();
        Ok(match limit {
            Some(n) => all.into_iter().take(n).collect(),
            None => all,
        })
    }

    async fn append_ingestion_log(&self, entry: &IngestionLogEntry) -> Result<(), PipelineError> {
        let mut logs = self.logs.write().expect("logs lock poisoned");
        logs.entry(entry.source_id.clone())
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    async fn get_ingestion_log(
        &self,
        source_id: &str,
    ) -> Result<Vec<IngestionLogEntry>, PipelineError> {
        let logs = self.logs.read().expect("logs lock poisoned");
        let mut entries = logs.get(source_id).cloned().unwrap_or_default();
        entries.reverse();
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn doc(source_id: &str, version: u64) -> SchemaDocument {
        SchemaDocument {
            source_id: source_id.to_string(),
            version,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            collections: BTreeMap::new(),
            data_types_present: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_cas_insert_and_update() {
        let store = MemoryStore::new();
        store.put_schema(&doc("s", 1), 0).await.unwrap();
        store.put_schema(&doc("s", 2), 1).await.unwrap();
        let fetched = store.get_schema("s").await.unwrap().unwrap();
        assert_eq!(fetched.version, 2);
    }

    #[tokio::test]
    async fn test_cas_conflict_on_stale_version() {
        let store = MemoryStore::new();
        store.put_schema(&doc("s", 1), 0).await.unwrap();
        let err = store.put_schema(&doc("s", 2), 0).await.unwrap_err();
        assert!(matches!(err, PipelineError::SchemaConflict { expected: 0, .. }));
        let err = store.put_schema(&doc("s", 3), 2).await.unwrap_err();
        assert!(matches!(err, PipelineError::SchemaConflict { expected: 2, .. }));
    }

    #[tokio::test]
    async fn test_records_kept_per_shape() {
        let store = MemoryStore::new();
        let record = CanonicalRecord {
            fields: FieldMap::new(),
            hash: "h".to_string(),
        };
        store
            .insert_records("s", ShapeKind::Json, &[record.clone()])
            .await
            .unwrap();
        store
            .insert_records("s", ShapeKind::Tabular, &[record.clone(), record])
            .await
            .unwrap();
        assert_eq!(store.get_records("s", ShapeKind::Json, None).await.unwrap().len(), 1);
        assert_eq!(
            store.get_records("s", ShapeKind::Tabular, None).await.unwrap().len(),
            2
        );
        assert_eq!(
            store.get_records("s", ShapeKind::Tabular, Some(1)).await.unwrap().len(),
            1
        );
    }
}
