//! Pipeline orchestration.
//!
//! Sequences one document through detection, parsing, canonicalization,
//! inference, and schema evolution, and commits the outcome to the store.
//! Ingestions for different source identities run fully in parallel;
//! ingestions for the same identity are serialized through a per-identity
//! lock so the schema read-merge-write is one atomic unit of work. The
//! store's versioned compare-and-swap additionally guards against writers
//! outside this process; a lost race is retried once with a fresh read.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::canonical::{canonicalize, CanonicalBatch};
use crate::detect::{detect_fragments, rescore_ambiguous};
use crate::extract;
use crate::models::{
    FragmentFailure, IngestionLogEntry, IngestionResult, IngestionStatus, PipelineError,
    SchemaDocument, SchemaHistoryEntry, ShapeKind,
};
use crate::oracle::ClassificationOracle;
use crate::parse::parse_fragment;
use crate::schema::{evolve, infer_signature, BatchSignature};
use crate::store::SchemaStore;

/// The extraction → cleaning → schema-evolution pipeline for one store.
pub struct Pipeline {
    store: Arc<dyn SchemaStore>,
    oracle: Option<Box<dyn ClassificationOracle>>,
    oracle_timeout: Duration,
    conflict_retries: u32,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Pipeline {
    pub fn new(store: Arc<dyn SchemaStore>) -> Self {
        Self {
            store,
            oracle: None,
            oracle_timeout: Duration::from_secs(10),
            conflict_retries: 1,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Attach an advisory classification oracle, called with the given
    /// timeout for documents whose detection is ambiguous.
    pub fn with_oracle(mut self, oracle: Box<dyn ClassificationOracle>, timeout: Duration) -> Self {
        self.oracle = Some(oracle);
        self.oracle_timeout = timeout;
        self
    }

    pub fn with_conflict_retries(mut self, retries: u32) -> Self {
        self.conflict_retries = retries;
        self
    }

    /// Extract text from a file and ingest it.
    pub async fn ingest_file(
        &self,
        source_id: &str,
        path: &Path,
    ) -> Result<IngestionResult, PipelineError> {
        let (text, file_type) = extract::extract_text(path)?;
        info!(source_id, file_type, chars = text.len(), "extracted document text");
        self.ingest(source_id, &text).await
    }

    /// Ingest one decoded document for a source identity.
    ///
    /// Fragment-level failures are recovered and reported in the result's
    /// `errors`; only store and version-conflict failures abort the whole
    /// ingestion. A failure before the schema commit leaves nothing
    /// persisted.
    pub async fn ingest(
        &self,
        source_id: &str,
        text: &str,
    ) -> Result<IngestionResult, PipelineError> {
        let identity_lock = self.identity_lock(source_id);
        let _guard = identity_lock.lock().await;

        let mut fragments = detect_fragments(text);
        if let Some(oracle) = &self.oracle {
            rescore_ambiguous(&mut fragments, text, oracle.as_ref(), self.oracle_timeout).await;
        }

        let fragments_found = fragments
            .iter()
            .filter(|f| f.kind != ShapeKind::Unknown)
            .count();

        let mut errors: Vec<FragmentFailure> = Vec::new();
        let mut raw_per_shape: BTreeMap<ShapeKind, Vec<crate::models::FieldMap>> = BTreeMap::new();

        for fragment in &fragments {
            if fragment.kind == ShapeKind::Unknown {
                continue;
            }
            match parse_fragment(fragment) {
                Ok(records) if records.is_empty() => {
                    // A claimed fragment that yields no records is discarded,
                    // not propagated as an empty shape.
                }
                Ok(records) => raw_per_shape
                    .entry(fragment.kind)
                    .or_default()
                    .extend(records),
                Err(e) => {
                    warn!(source_id, kind = %fragment.kind, error = %e, "fragment dropped");
                    errors.push(FragmentFailure {
                        kind: fragment.kind,
                        start: fragment.start,
                        end: fragment.end,
                        reason: e.to_string(),
                    });
                }
            }
        }

        if raw_per_shape.is_empty() {
            let version = self
                .store
                .get_schema(source_id)
                .await?
                .map(|d| d.version)
                .unwrap_or(0);
            errors.push(FragmentFailure {
                kind: ShapeKind::Unknown,
                start: 0,
                end: text.len(),
                reason: "no structured data (JSON/tabular/markup-table) found in document"
                    .to_string(),
            });
            return Ok(IngestionResult {
                source_id: source_id.to_string(),
                status: IngestionStatus::Error,
                fragments_found,
                records_per_shape: BTreeMap::new(),
                schema_version: version,
                errors,
            });
        }

        let batches: Vec<CanonicalBatch> = raw_per_shape
            .into_iter()
            .map(|(shape, raw)| canonicalize(shape, raw))
            .collect();
        let signatures: Vec<BatchSignature> = batches
            .iter()
            .map(|b| infer_signature(b.shape, &b.records))
            .collect();

        // The schema commit is the serialization point. The history,
        // record, and log writes below are appends; a store failure
        // mid-sequence surfaces with the version already advanced.
        let (doc, entry) = self.commit_schema(source_id, &signatures).await?;
        self.store.append_history(source_id, &entry).await?;

        let mut records_per_shape = BTreeMap::new();
        let mut record_count: u64 = 0;
        for batch in &batches {
            self.store
                .insert_records(source_id, batch.shape, &batch.records)
                .await?;
            records_per_shape.insert(batch.shape.as_str().to_string(), batch.records.len() as u64);
            record_count += batch.records.len() as u64;
        }

        self.store
            .append_ingestion_log(&IngestionLogEntry {
                source_id: source_id.to_string(),
                fragments_found,
                record_count,
                shapes: batches.iter().map(|b| b.shape.as_str().to_string()).collect(),
                timestamp: Utc::now(),
            })
            .await?;

        let status = if errors.is_empty() {
            IngestionStatus::Success
        } else {
            IngestionStatus::Partial
        };
        info!(
            source_id,
            version = doc.version,
            records = record_count,
            failed_fragments = errors.len(),
            "ingestion committed"
        );

        Ok(IngestionResult {
            source_id: source_id.to_string(),
            status,
            fragments_found,
            records_per_shape,
            schema_version: doc.version,
            errors,
        })
    }

    /// Read the current schema for a source.
    pub async fn get_schema(
        &self,
        source_id: &str,
    ) -> Result<Option<SchemaDocument>, PipelineError> {
        self.store.get_schema(source_id).await
    }

    /// Read-merge-write of the schema document with compare-and-swap, one
    /// retry with a fresh read on a lost race.
    async fn commit_schema(
        &self,
        source_id: &str,
        signatures: &[BatchSignature],
    ) -> Result<(SchemaDocument, SchemaHistoryEntry), PipelineError> {
        let mut attempts = 0;
        loop {
            let existing = self.store.get_schema(source_id).await?;
            let expected = existing.as_ref().map(|d| d.version).unwrap_or(0);
            let (doc, entry) = evolve(existing, source_id, signatures, Utc::now());

            match self.store.put_schema(&doc, expected).await {
                Ok(()) => return Ok((doc, entry)),
                Err(PipelineError::SchemaConflict { .. }) if attempts < self.conflict_retries => {
                    attempts += 1;
                    warn!(source_id, expected, "schema version race lost, retrying with fresh read");
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn identity_lock(&self, source_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().expect("lock registry poisoned");
        locks
            .entry(source_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}
