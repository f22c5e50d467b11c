//! Record canonicalizer: field-name normalization, scalar type inference,
//! and in-batch deduplication.
//!
//! Runs once per ingestion batch (all records from one document). Shape
//! parsers emit raw string cells or native JSON values; this module turns
//! them into [`CanonicalRecord`]s with normalized names and inferred scalar
//! types. Canonicalization is idempotent: re-running it on its own output
//! changes nothing.

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::models::{CanonicalRecord, FieldMap, ShapeKind};

/// Boolean literals accepted by scalar inference, lowercase.
const TRUE_LITERALS: &[&str] = &["true", "yes", "y"];
const FALSE_LITERALS: &[&str] = &["false", "no", "n"];

/// Canonicalized records for one shape kind of one batch.
#[derive(Debug, Clone)]
pub struct CanonicalBatch {
    pub shape: ShapeKind,
    /// Deduplicated records in first-occurrence order.
    pub records: Vec<CanonicalRecord>,
    /// Record count before deduplication, for reporting.
    pub raw_count: usize,
}

/// Normalize field names, infer scalar types, and deduplicate one shape's
/// raw records.
pub fn canonicalize(shape: ShapeKind, raw: Vec<FieldMap>) -> CanonicalBatch {
    let raw_count = raw.len();
    let mut seen = std::collections::HashSet::new();
    let mut records = Vec::new();

    for fields in raw {
        let mut normalized = FieldMap::new();
        for (name, value) in fields {
            normalized.insert(normalize_field_name(&name), clean_value(value));
        }
        let hash = content_hash(&normalized);
        if seen.insert(hash.clone()) {
            records.push(CanonicalRecord {
                fields: normalized,
                hash,
            });
        }
    }

    tracing::debug!(
        shape = %shape,
        raw = raw_count,
        unique = records.len(),
        "canonicalized batch"
    );

    CanonicalBatch {
        shape,
        records,
        raw_count,
    }
}

/// Lowercase, non-alphanumeric runs collapsed to a single `_`, leading and
/// trailing underscores trimmed. Empty input falls back to `"field"` so a
/// record never carries a nameless column.
pub fn normalize_field_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_underscore = false;
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            last_underscore = false;
        } else if !last_underscore && !out.is_empty() {
            out.push('_');
            last_underscore = true;
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    if out.is_empty() {
        "field".to_string()
    } else {
        out
    }
}

/// Recursively clean a raw value.
///
/// Strings are trimmed and run through scalar inference; empty strings
/// become null. Arrays and objects keep their structural type with leaves
/// cleaned in place. Already-typed values pass through unchanged, which is
/// what makes canonicalization idempotent.
pub fn clean_value(value: Value) -> Value {
    match value {
        Value::String(s) => infer_scalar(s.trim()),
        Value::Array(items) => Value::Array(items.into_iter().map(clean_value).collect()),
        Value::Object(map) => {
            Value::Object(map.into_iter().map(|(k, v)| (k, clean_value(v))).collect())
        }
        other => other,
    }
}

/// Whether a raw cell coerces to a non-string scalar (boolean or number).
/// Used by the tabular parser's header detection.
pub(crate) fn coerces_to_scalar(cell: &str) -> bool {
    !matches!(infer_scalar(cell.trim()), Value::String(_) | Value::Null)
}

/// Infer a scalar from a trimmed string, in strict precedence:
/// boolean → integer (lossless) → float (lossless, incl. scientific) →
/// string. Empty input becomes null.
fn infer_scalar(s: &str) -> Value {
    if s.is_empty() {
        return Value::Null;
    }

    let lower = s.to_ascii_lowercase();
    if TRUE_LITERALS.contains(&lower.as_str()) {
        return Value::Bool(true);
    }
    if FALSE_LITERALS.contains(&lower.as_str()) {
        return Value::Bool(false);
    }

    if let Ok(i) = s.parse::<i64>() {
        return Value::Number(i.into());
    }

    if let Ok(f) = s.parse::<f64>() {
        if f.is_finite() {
            if let Some(n) = serde_json::Number::from_f64(f) {
                return Value::Number(n);
            }
        }
    }

    Value::String(s.to_string())
}

/// Stable content hash of a record: SHA-256 over a key-sorted JSON
/// serialization, so field order never affects record identity.
pub fn content_hash(fields: &FieldMap) -> String {
    let sorted = sort_keys(&Value::Object(fields.clone()));
    let encoded = serde_json::to_string(&sorted).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(encoded.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = FieldMap::new();
            for k in keys {
                out.insert(k.clone(), sort_keys(&map[k]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}
