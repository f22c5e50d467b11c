//! Schema inference and evolution.
//!
//! [`infer_signature`] describes exactly one batch of canonical records;
//! [`evolve`] merges batch signatures into a source's persisted schema
//! document. Evolution is monotone: types only widen (`mixed` is sticky)
//! and the required flag only moves toward optional. The version increments
//! by exactly one per ingested document, even when only record counts
//! change.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::models::{
    CanonicalRecord, FieldSignature, FieldType, SchemaDiffSummary, SchemaDocument,
    SchemaHistoryEntry, ShapeKind, ShapeSchema,
};

/// The field-type signature of one batch for one shape kind.
#[derive(Debug, Clone)]
pub struct BatchSignature {
    pub shape: ShapeKind,
    pub fields: BTreeMap<String, FieldSignature>,
    /// Post-dedup record count of the batch.
    pub record_count: u64,
}

/// Compute the signature describing exactly this batch.
///
/// For each field appearing in at least one record: the type is the
/// narrowest common type across non-null observed values (an all-null field
/// infers `mixed`), `required` means non-null-present in 100% of the
/// batch's records, and the sample is the last non-null value in record
/// order.
pub fn infer_signature(shape: ShapeKind, records: &[CanonicalRecord]) -> BatchSignature {
    struct Accum {
        field_type: Option<FieldType>,
        non_null: usize,
        sample: Value,
    }

    let total = records.len();
    let mut accums: BTreeMap<String, Accum> = BTreeMap::new();

    for record in records {
        for (name, value) in &record.fields {
            let accum = accums.entry(name.clone()).or_insert(Accum {
                field_type: None,
                non_null: 0,
                sample: Value::Null,
            });
            if let Some(t) = FieldType::of_value(value) {
                accum.non_null += 1;
                accum.field_type = Some(match accum.field_type {
                    Some(prev) => prev.unify(t),
                    None => t,
                });
                accum.sample = value.clone();
            }
        }
    }

    let fields = accums
        .into_iter()
        .map(|(name, accum)| {
            (
                name,
                FieldSignature {
                    field_type: accum.field_type.unwrap_or(FieldType::Mixed),
                    required: total > 0 && accum.non_null == total,
                    sample: accum.sample,
                },
            )
        })
        .collect();

    BatchSignature {
        shape,
        fields,
        record_count: records.len() as u64,
    }
}

/// Merge a document's batch signatures into the persisted schema, producing
/// the next version and its history entry.
///
/// All shapes of one ingested document merge in a single call so the
/// version advances exactly once per document. The caller persists the
/// returned document and appends the history entry atomically.
pub fn evolve(
    existing: Option<SchemaDocument>,
    source_id: &str,
    batches: &[BatchSignature],
    now: DateTime<Utc>,
) -> (SchemaDocument, SchemaHistoryEntry) {
    let mut doc = existing.unwrap_or_else(|| SchemaDocument {
        source_id: source_id.to_string(),
        version: 0,
        created_at: now,
        updated_at: now,
        collections: BTreeMap::new(),
        data_types_present: Vec::new(),
    });
    doc.version += 1;
    doc.updated_at = now;

    let mut summary = SchemaDiffSummary::default();

    for batch in batches {
        let key = batch.shape.as_str().to_string();
        summary.records_added += batch.record_count;

        if !doc.data_types_present.contains(&key) {
            doc.data_types_present.push(key.clone());
        }

        match doc.collections.get_mut(&key) {
            None => {
                // First batch for this shape: the batch signature is the
                // cumulative history, so its required flags stand.
                summary.shapes_added.push(key.clone());
                summary
                    .fields_added
                    .extend(batch.fields.keys().map(|f| format!("{}.{}", key, f)));
                doc.collections.insert(
                    key.clone(),
                    ShapeSchema {
                        fields: batch.fields.clone(),
                        record_count: batch.record_count,
                        source_type: key,
                    },
                );
            }
            Some(shape_schema) => {
                merge_shape(shape_schema, batch, &key, &mut summary);
            }
        }
    }

    let entry = SchemaHistoryEntry {
        version: doc.version,
        timestamp: now,
        summary: summary.clone(),
    };
    (doc, entry)
}

fn merge_shape(
    shape_schema: &mut ShapeSchema,
    batch: &BatchSignature,
    key: &str,
    summary: &mut SchemaDiffSummary,
) {
    for (name, sig) in &batch.fields {
        match shape_schema.fields.get_mut(name) {
            Some(old) => {
                let merged = old.field_type.unify(sig.field_type);
                if merged != old.field_type {
                    summary.fields_widened.push(format!("{}.{}", key, name));
                }
                old.field_type = merged;
                old.required = old.required && sig.required;
                old.sample = sig.sample.clone();
            }
            None => {
                // A field absent from all earlier batches has 0% historical
                // presence, so it enters optional even if this batch always
                // carries it.
                summary.fields_added.push(format!("{}.{}", key, name));
                shape_schema.fields.insert(
                    name.clone(),
                    FieldSignature {
                        field_type: sig.field_type,
                        required: false,
                        sample: sig.sample.clone(),
                    },
                );
            }
        }
    }

    // Required is recomputed against the full history every merge: a field
    // missing from this batch is no longer present in 100% of records.
    if batch.record_count > 0 {
        for (name, old) in shape_schema.fields.iter_mut() {
            if !batch.fields.contains_key(name) {
                old.required = false;
            }
        }
    }

    shape_schema.record_count += batch.record_count;
}
