//! Core data models used throughout Schemaflow.
//!
//! These types represent the fragments, records, and schema documents that
//! flow through the extraction and evolution pipeline, plus the pipeline
//! error taxonomy.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Ordered field map of a single record. `serde_json`'s `preserve_order`
/// feature keeps insertion order, which the canonicalizer relies on.
pub type FieldMap = serde_json::Map<String, Value>;

/// Structural category of a detected fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ShapeKind {
    #[serde(rename = "json")]
    Json,
    #[serde(rename = "tabular")]
    Tabular,
    #[serde(rename = "markup-table")]
    MarkupTable,
    #[serde(rename = "xml")]
    Xml,
    #[serde(rename = "unknown")]
    Unknown,
}

impl ShapeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShapeKind::Json => "json",
            ShapeKind::Tabular => "tabular",
            ShapeKind::MarkupTable => "markup-table",
            ShapeKind::Xml => "xml",
            ShapeKind::Unknown => "unknown",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "json" => Some(ShapeKind::Json),
            "tabular" => Some(ShapeKind::Tabular),
            "markup-table" | "markup_table" | "html" => Some(ShapeKind::MarkupTable),
            "xml" => Some(ShapeKind::Xml),
            "unknown" => Some(ShapeKind::Unknown),
            _ => None,
        }
    }
}

impl std::fmt::Display for ShapeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A contiguous span of document text classified as one shape kind.
#[derive(Debug, Clone)]
pub struct Fragment {
    pub kind: ShapeKind,
    /// Byte offset of the span start in the source document.
    pub start: usize,
    /// Byte offset one past the span end.
    pub end: usize,
    pub text: String,
    /// Heuristic parse confidence in `[0.0, 1.0]`.
    pub confidence: f64,
}

/// A normalized, deduplicated record. Immutable once produced; corrections
/// require a new ingestion.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalRecord {
    pub fields: FieldMap,
    /// SHA-256 over a key-sorted serialization of `fields`; dedup key.
    pub hash: String,
}

/// Inferred value type for a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Integer,
    Float,
    Boolean,
    String,
    Array,
    Object,
    Mixed,
}

impl FieldType {
    /// Type of a single JSON value. `None` for null: nulls contribute
    /// nothing to unification.
    pub fn of_value(value: &Value) -> Option<FieldType> {
        match value {
            Value::Null => None,
            Value::Bool(_) => Some(FieldType::Boolean),
            Value::Number(n) => {
                if n.is_i64() || n.is_u64() {
                    Some(FieldType::Integer)
                } else {
                    Some(FieldType::Float)
                }
            }
            Value::String(_) => Some(FieldType::String),
            Value::Array(_) => Some(FieldType::Array),
            Value::Object(_) => Some(FieldType::Object),
        }
    }

    /// Narrowest common type of two observed types. Widening is monotone:
    /// `Mixed` absorbs everything, integers and floats unify to `Float`,
    /// and any other disagreement (boolean vs numeric, string vs numeric,
    /// array vs scalar, object vs scalar) is `Mixed`.
    pub fn unify(self, other: FieldType) -> FieldType {
        use FieldType::*;
        match (self, other) {
            (a, b) if a == b => a,
            (Integer, Float) | (Float, Integer) => Float,
            _ => Mixed,
        }
    }
}

/// Per-field description within one batch signature or one shape schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldSignature {
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub required: bool,
    pub sample: Value,
}

/// Cumulative schema for one shape kind of one source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShapeSchema {
    pub fields: BTreeMap<String, FieldSignature>,
    pub record_count: u64,
    pub source_type: String,
}

/// Versioned, self-describing schema for one source identity.
///
/// The serde shape is the persisted wire form:
/// `{source_id, version, created_at, updated_at, collections, data_types_present}`.
/// Mutated only by the evolution manager; every mutation appends a
/// [`SchemaHistoryEntry`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchemaDocument {
    pub source_id: String,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub collections: BTreeMap<String, ShapeSchema>,
    pub data_types_present: Vec<String>,
}

/// Immutable audit snapshot appended whenever a schema document changes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchemaHistoryEntry {
    pub version: u64,
    pub timestamp: DateTime<Utc>,
    pub summary: SchemaDiffSummary,
}

/// What a single ingestion changed, for audit and history display.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SchemaDiffSummary {
    pub shapes_added: Vec<String>,
    /// `"shape.field"` entries for fields absent before this version.
    pub fields_added: Vec<String>,
    /// `"shape.field"` entries whose type widened in this version.
    pub fields_widened: Vec<String>,
    pub records_added: u64,
}

/// One row of the ingestion log: a successful document ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionLogEntry {
    pub source_id: String,
    pub fragments_found: usize,
    pub record_count: u64,
    pub shapes: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// Outcome status of one ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestionStatus {
    /// All detected fragments parsed and the schema committed.
    Success,
    /// The schema committed but some fragments failed; see `errors`.
    Partial,
    /// Nothing was committed.
    Error,
}

/// A fragment that failed to parse, reported without aborting the batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FragmentFailure {
    pub kind: ShapeKind,
    pub start: usize,
    pub end: usize,
    pub reason: String,
}

/// Structured result of `ingest(source_id, text)`.
#[derive(Debug, Clone, Serialize)]
pub struct IngestionResult {
    pub source_id: String,
    pub status: IngestionStatus,
    pub fragments_found: usize,
    /// Post-dedup record counts committed in this ingestion, per shape.
    pub records_per_shape: BTreeMap<String, u64>,
    /// Schema version after this ingestion (0 if nothing was committed and
    /// the source had no prior schema).
    pub schema_version: u64,
    pub errors: Vec<FragmentFailure>,
}

/// Pipeline error taxonomy.
///
/// Detection and parse failures are recovered per-fragment and reported in
/// [`IngestionResult::errors`]; only validation, conflict, and store
/// failures abort an ingestion.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A span could not be classified; the detector demotes it to
    /// [`ShapeKind::Unknown`] and continues.
    #[error("unclassifiable span at byte {offset}: {reason}")]
    Detection { offset: usize, reason: String },

    /// A fragment claimed by a shape was unparsable after repair attempts.
    /// The fragment is dropped; the document continues.
    #[error("{kind} fragment failed to parse: {reason}")]
    Parse { kind: ShapeKind, reason: String },

    /// Unsupported document type; the document is rejected before the
    /// pipeline runs.
    #[error("unsupported document type: {0}")]
    Validation(String),

    /// A concurrent writer won the schema version race. Retried once with a
    /// fresh read before being surfaced.
    #[error("schema write conflict for source '{source_id}' at version {expected}")]
    SchemaConflict { source_id: String, expected: u64 },

    /// Persistence is unreachable; the ingestion aborts where it stood.
    /// Before the schema commit nothing has been persisted.
    #[error("document store unavailable: {0}")]
    StoreUnavailable(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_shape_kind_round_trip() {
        for kind in [
            ShapeKind::Json,
            ShapeKind::Tabular,
            ShapeKind::MarkupTable,
            ShapeKind::Xml,
            ShapeKind::Unknown,
        ] {
            assert_eq!(ShapeKind::from_str_opt(kind.as_str()), Some(kind));
        }
        assert_eq!(ShapeKind::from_str_opt("csv"), None);
    }

    #[test]
    fn test_field_type_of_value() {
        assert_eq!(FieldType::of_value(&json!(1)), Some(FieldType::Integer));
        assert_eq!(FieldType::of_value(&json!(1.5)), Some(FieldType::Float));
        assert_eq!(FieldType::of_value(&json!(true)), Some(FieldType::Boolean));
        assert_eq!(FieldType::of_value(&json!("x")), Some(FieldType::String));
        assert_eq!(FieldType::of_value(&json!([1])), Some(FieldType::Array));
        assert_eq!(FieldType::of_value(&json!({"a": 1})), Some(FieldType::Object));
        assert_eq!(FieldType::of_value(&Value::Null), None);
    }

    #[test]
    fn test_unify_numeric_widening() {
        assert_eq!(FieldType::Integer.unify(FieldType::Integer), FieldType::Integer);
        assert_eq!(FieldType::Integer.unify(FieldType::Float), FieldType::Float);
        assert_eq!(FieldType::Float.unify(FieldType::Integer), FieldType::Float);
    }

    #[test]
    fn test_unify_disagreements_are_mixed() {
        assert_eq!(FieldType::Boolean.unify(FieldType::Integer), FieldType::Mixed);
        assert_eq!(FieldType::String.unify(FieldType::Float), FieldType::Mixed);
        assert_eq!(FieldType::Array.unify(FieldType::String), FieldType::Mixed);
        assert_eq!(FieldType::Object.unify(FieldType::Integer), FieldType::Mixed);
    }

    #[test]
    fn test_mixed_is_sticky() {
        for t in [
            FieldType::Integer,
            FieldType::Float,
            FieldType::Boolean,
            FieldType::String,
            FieldType::Array,
            FieldType::Object,
            FieldType::Mixed,
        ] {
            assert_eq!(FieldType::Mixed.unify(t), FieldType::Mixed);
            assert_eq!(t.unify(FieldType::Mixed), FieldType::Mixed);
        }
    }

    #[test]
    fn test_schema_document_wire_shape() {
        let mut fields = BTreeMap::new();
        fields.insert(
            "id".to_string(),
            FieldSignature {
                field_type: FieldType::Integer,
                required: true,
                sample: json!(2),
            },
        );
        let mut collections = BTreeMap::new();
        collections.insert(
            "json".to_string(),
            ShapeSchema {
                fields,
                record_count: 2,
                source_type: "json".to_string(),
            },
        );
        let doc = SchemaDocument {
            source_id: "s1".to_string(),
            version: 1,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            collections,
            data_types_present: vec!["json".to_string()],
        };

        let wire = serde_json::to_value(&doc).unwrap();
        assert_eq!(wire["source_id"], "s1");
        assert_eq!(wire["version"], 1);
        assert_eq!(wire["collections"]["json"]["record_count"], 2);
        assert_eq!(wire["collections"]["json"]["fields"]["id"]["type"], "integer");
        assert_eq!(wire["collections"]["json"]["fields"]["id"]["required"], true);
        assert_eq!(wire["collections"]["json"]["fields"]["id"]["sample"], 2);
        assert_eq!(wire["data_types_present"][0], "json");

        let back: SchemaDocument = serde_json::from_value(wire).unwrap();
        assert_eq!(back, doc);
    }
}
