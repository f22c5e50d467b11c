use std::str::FromStr;
use std::sync::Arc;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

use schemaflow::ingest::Pipeline;
use schemaflow::models::{FieldType, IngestionStatus, PipelineError, ShapeKind};
use schemaflow::schema::{evolve, infer_signature};
use schemaflow::store::{MemoryStore, SchemaStore, SqliteStore};

fn memory_pipeline() -> (Arc<MemoryStore>, Pipeline) {
    let store = Arc::new(MemoryStore::new());
    let pipeline = Pipeline::new(store.clone());
    (store, pipeline)
}

#[tokio::test]
async fn first_json_ingestion_creates_version_one() {
    let (_store, pipeline) = memory_pipeline();
    let doc = "{\"id\":1,\"name\":\"Widget\",\"price\":9.99}\n{\"id\":2,\"name\":\"Gadget\",\"price\":19.99}";
    let result = pipeline.ingest("products", doc).await.unwrap();

    assert_eq!(result.status, IngestionStatus::Success);
    assert_eq!(result.schema_version, 1);
    assert_eq!(result.records_per_shape["json"], 2);

    let schema = pipeline.get_schema("products").await.unwrap().unwrap();
    assert_eq!(schema.version, 1);
    assert_eq!(schema.data_types_present, vec!["json"]);
    let shape = &schema.collections["json"];
    assert_eq!(shape.record_count, 2);
    assert_eq!(shape.fields["id"].field_type, FieldType::Integer);
    assert!(shape.fields["id"].required);
    assert_eq!(shape.fields["name"].field_type, FieldType::String);
    assert!(shape.fields["name"].required);
    assert_eq!(shape.fields["price"].field_type, FieldType::Float);
    assert!(shape.fields["price"].required);
}

#[tokio::test]
async fn new_field_enters_optional() {
    let (_store, pipeline) = memory_pipeline();
    pipeline
        .ingest(
            "products",
            "{\"id\":1,\"name\":\"Widget\",\"price\":9.99}\n{\"id\":2,\"name\":\"Gadget\",\"price\":19.99}",
        )
        .await
        .unwrap();
    let result = pipeline
        .ingest("products", "{\"id\":3,\"name\":\"Thing\",\"price\":5,\"rating\":4.5}")
        .await
        .unwrap();
    assert_eq!(result.schema_version, 2);

    let schema = pipeline.get_schema("products").await.unwrap().unwrap();
    let shape = &schema.collections["json"];
    assert_eq!(shape.record_count, 3);
    assert_eq!(shape.fields["rating"].field_type, FieldType::Float);
    assert!(!shape.fields["rating"].required);
    assert!(shape.fields["id"].required);
    assert!(shape.fields["name"].required);
    assert!(shape.fields["price"].required);
    // int mixed into float history stays float
    assert_eq!(shape.fields["price"].field_type, FieldType::Float);
}

#[tokio::test]
async fn tabular_block_with_header() {
    let (_store, pipeline) = memory_pipeline();
    let result = pipeline
        .ingest("inventory", "id,name\n1,Alice\n2,Bob")
        .await
        .unwrap();

    assert_eq!(result.schema_version, 1);
    assert_eq!(result.records_per_shape["tabular"], 2);

    let schema = pipeline.get_schema("inventory").await.unwrap().unwrap();
    let shape = &schema.collections["tabular"];
    assert_eq!(shape.record_count, 2);
    assert_eq!(shape.source_type, "tabular");
    assert_eq!(shape.fields["id"].field_type, FieldType::Integer);
    assert!(shape.fields["id"].required);
    assert_eq!(shape.fields["name"].field_type, FieldType::String);
    assert!(shape.fields["name"].required);
}

#[tokio::test]
async fn type_conflict_becomes_mixed() {
    let (_store, pipeline) = memory_pipeline();
    pipeline.ingest("prices", "{\"price\": 10}").await.unwrap();
    pipeline.ingest("prices", "{\"price\": \"N/A\"}").await.unwrap();

    let schema = pipeline.get_schema("prices").await.unwrap().unwrap();
    assert_eq!(
        schema.collections["json"].fields["price"].field_type,
        FieldType::Mixed
    );

    // And it never narrows back.
    pipeline.ingest("prices", "{\"price\": 12}").await.unwrap();
    let schema = pipeline.get_schema("prices").await.unwrap().unwrap();
    assert_eq!(
        schema.collections["json"].fields["price"].field_type,
        FieldType::Mixed
    );
}

#[tokio::test]
async fn concurrent_writers_never_share_a_version() {
    let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());

    // Bring the source to version 3.
    let setup = Pipeline::new(store.clone());
    for i in 0..3 {
        setup
            .ingest("busy", &format!("{{\"id\": {}}}", i))
            .await
            .unwrap();
    }

    // Two writers race from the same snapshot at version 3.
    let base = store.get_schema("busy").await.unwrap().unwrap();
    assert_eq!(base.version, 3);
    let sig = infer_signature(
        ShapeKind::Json,
        &schemaflow::canonical::canonicalize(
            ShapeKind::Json,
            vec![serde_json::from_str("{\"id\": 99}").unwrap()],
        )
        .records,
    );
    let (doc_a, _) = evolve(Some(base.clone()), "busy", std::slice::from_ref(&sig), chrono::Utc::now());
    let (doc_b, _) = evolve(Some(base), "busy", std::slice::from_ref(&sig), chrono::Utc::now());

    store.put_schema(&doc_a, 3).await.unwrap();
    let err = store.put_schema(&doc_b, 3).await.unwrap_err();
    assert!(matches!(err, PipelineError::SchemaConflict { expected: 3, .. }));

    // The loser re-reads and lands on version 5.
    let fresh = store.get_schema("busy").await.unwrap().unwrap();
    assert_eq!(fresh.version, 4);
    let (doc_b2, _) = evolve(Some(fresh), "busy", std::slice::from_ref(&sig), chrono::Utc::now());
    store.put_schema(&doc_b2, 4).await.unwrap();
    assert_eq!(store.get_schema("busy").await.unwrap().unwrap().version, 5);
}

#[tokio::test]
async fn concurrent_pipelines_commit_distinct_versions() {
    let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
    let setup = Pipeline::new(store.clone());
    setup.ingest("busy", "{\"id\": 0}").await.unwrap();

    // Separate pipelines have separate in-process locks, so only the
    // store's compare-and-swap serializes them.
    let p1 = Pipeline::new(store.clone());
    let p2 = Pipeline::new(store.clone());
    let (r1, r2) = tokio::join!(
        p1.ingest("busy", "{\"id\": 1}"),
        p2.ingest("busy", "{\"id\": 2}"),
    );
    let (r1, r2) = (r1.unwrap(), r2.unwrap());

    assert_ne!(r1.schema_version, r2.schema_version);
    let schema = store.get_schema("busy").await.unwrap().unwrap();
    assert_eq!(schema.version, 3);
    assert_eq!(schema.collections["json"].record_count, 3);
}

#[tokio::test]
async fn mixed_document_produces_one_version_across_shapes() {
    let (store, pipeline) = memory_pipeline();
    let doc = "Shipment manifest follows.\n\
               {\"order\": 17, \"carrier\": \"acme\"}\n\
               sku,qty\n\
               BOLT-1,40\n\
               NUT-2,95\n\
               <table><tr><th>bin</th><th>aisle</th></tr><tr><td>B7</td><td>3</td></tr></table>\n\
               End of manifest.";
    let result = pipeline.ingest("warehouse", doc).await.unwrap();

    assert_eq!(result.status, IngestionStatus::Success);
    assert_eq!(result.schema_version, 1);
    assert_eq!(result.fragments_found, 3);
    assert_eq!(result.records_per_shape["json"], 1);
    assert_eq!(result.records_per_shape["tabular"], 2);
    assert_eq!(result.records_per_shape["markup-table"], 1);

    let schema = pipeline.get_schema("warehouse").await.unwrap().unwrap();
    assert_eq!(schema.version, 1);
    assert_eq!(schema.collections.len(), 3);
    assert_eq!(
        schema.collections["markup-table"].fields["bin"].field_type,
        FieldType::String
    );
    assert_eq!(
        schema.collections["tabular"].fields["qty"].field_type,
        FieldType::Integer
    );

    // Records landed per shape.
    let tabular = store
        .get_records("warehouse", ShapeKind::Tabular, None)
        .await
        .unwrap();
    assert_eq!(tabular.len(), 2);
    assert_eq!(tabular[0]["sku"], serde_json::json!("BOLT-1"));
    assert_eq!(tabular[0]["qty"], serde_json::json!(40));
}

#[tokio::test]
async fn xml_document_yields_flat_records() {
    let (store, pipeline) = memory_pipeline();
    let doc = "<inventory>\n\
               <item><sku>A-1</sku><qty>4</qty></item>\n\
               <item><sku>B-2</sku><qty>9</qty></item>\n\
               </inventory>";
    let result = pipeline.ingest("stock", doc).await.unwrap();

    assert_eq!(result.status, IngestionStatus::Success);
    assert_eq!(result.records_per_shape["xml"], 2);

    let schema = pipeline.get_schema("stock").await.unwrap().unwrap();
    assert_eq!(schema.version, 1);
    assert_eq!(schema.data_types_present, vec!["xml"]);
    let shape = &schema.collections["xml"];
    assert_eq!(shape.record_count, 2);
    assert_eq!(shape.fields["sku"].field_type, FieldType::String);
    assert!(shape.fields["sku"].required);
    assert_eq!(shape.fields["qty"].field_type, FieldType::Integer);

    let records = store.get_records("stock", ShapeKind::Xml, None).await.unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["sku"], serde_json::json!("A-1"));
    assert_eq!(records[1]["qty"], serde_json::json!(9));
}

#[tokio::test]
async fn record_counts_are_conserved_across_ingestions() {
    let (_store, pipeline) = memory_pipeline();
    let mut expected = 0u64;
    for batch in [
        "{\"id\": 1}\n{\"id\": 2}",
        "{\"id\": 3}",
        "{\"id\": 4}\n{\"id\": 5}\n{\"id\": 6}",
    ] {
        let result = pipeline.ingest("counts", batch).await.unwrap();
        expected += result.records_per_shape["json"];
    }
    let schema = pipeline.get_schema("counts").await.unwrap().unwrap();
    assert_eq!(schema.collections["json"].record_count, expected);
    assert_eq!(schema.collections["json"].record_count, 6);
}

#[tokio::test]
async fn duplicate_records_within_a_batch_are_dropped() {
    let (_store, pipeline) = memory_pipeline();
    let result = pipeline
        .ingest("dups", "{\"id\": 1}\n{\"id\": 1}\n{\"id\": 2}")
        .await
        .unwrap();
    assert_eq!(result.records_per_shape["json"], 2);
    let schema = pipeline.get_schema("dups").await.unwrap().unwrap();
    assert_eq!(schema.collections["json"].record_count, 2);
}

#[tokio::test]
async fn monotone_optionality_across_versions() {
    let (store, pipeline) = memory_pipeline();
    pipeline
        .ingest("opt", "{\"id\": 1, \"tag\": \"a\"}")
        .await
        .unwrap();
    pipeline.ingest("opt", "{\"id\": 2}").await.unwrap();
    pipeline
        .ingest("opt", "{\"id\": 3, \"tag\": \"b\"}")
        .await
        .unwrap();

    let schema = pipeline.get_schema("opt").await.unwrap().unwrap();
    assert!(schema.collections["json"].fields["id"].required);
    assert!(!schema.collections["json"].fields["tag"].required);

    // History recorded every version.
    let history = store.get_history("opt").await.unwrap();
    assert_eq!(
        history.iter().map(|h| h.version).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert_eq!(history[0].summary.fields_added.len(), 2);
    assert!(history[1].summary.fields_added.is_empty());
}

#[tokio::test]
async fn repaired_json_still_ingests() {
    let (_store, pipeline) = memory_pipeline();
    let result = pipeline
        .ingest("lenient", "{'id': 1, qty: 4,}")
        .await
        .unwrap();
    assert_eq!(result.status, IngestionStatus::Success);
    let schema = pipeline.get_schema("lenient").await.unwrap().unwrap();
    assert_eq!(
        schema.collections["json"].fields["qty"].field_type,
        FieldType::Integer
    );
}

#[tokio::test]
async fn ingestion_log_tracks_uploads() {
    let (store, pipeline) = memory_pipeline();
    pipeline.ingest("logged", "{\"a\": 1}").await.unwrap();
    pipeline.ingest("logged", "left,right\n1,2\n3,4").await.unwrap();

    let log = store.get_ingestion_log("logged").await.unwrap();
    assert_eq!(log.len(), 2);
    // Newest first.
    assert_eq!(log[0].shapes, vec!["tabular"]);
    assert_eq!(log[0].record_count, 2);
    assert_eq!(log[1].shapes, vec!["json"]);
}

#[tokio::test]
async fn sqlite_store_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("sfl.sqlite");
    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))
        .unwrap()
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .unwrap();
    schemaflow::migrate::run_migrations(&pool).await.unwrap();

    let store = Arc::new(SqliteStore::new(pool));
    let pipeline = Pipeline::new(store.clone());

    pipeline
        .ingest("disk", "{\"id\": 1, \"name\": \"Widget\"}")
        .await
        .unwrap();
    pipeline
        .ingest("disk", "{\"id\": 2, \"name\": \"Gadget\", \"rating\": 4.5}")
        .await
        .unwrap();

    let schema = store.get_schema("disk").await.unwrap().unwrap();
    assert_eq!(schema.version, 2);
    assert_eq!(schema.collections["json"].record_count, 2);
    assert!(!schema.collections["json"].fields["rating"].required);

    let records = store.get_records("disk", ShapeKind::Json, None).await.unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["id"], serde_json::json!(1));

    let history = store.get_history("disk").await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].summary.fields_added, vec!["json.rating"]);

    // Stale writer loses the race on disk too.
    let mut stale = schema.clone();
    stale.version = 3;
    let err = store.put_schema(&stale, 1).await.unwrap_err();
    assert!(matches!(err, PipelineError::SchemaConflict { .. }));
}

#[tokio::test]
async fn different_sources_evolve_independently() {
    let (_store, pipeline) = memory_pipeline();
    pipeline.ingest("alpha", "{\"id\": 1}").await.unwrap();
    pipeline.ingest("beta", "{\"id\": \"a\"}").await.unwrap();

    let alpha = pipeline.get_schema("alpha").await.unwrap().unwrap();
    let beta = pipeline.get_schema("beta").await.unwrap().unwrap();
    assert_eq!(alpha.version, 1);
    assert_eq!(beta.version, 1);
    assert_eq!(alpha.collections["json"].fields["id"].field_type, FieldType::Integer);
    assert_eq!(beta.collections["json"].fields["id"].field_type, FieldType::String);
}
