use anyhow::Result;
use sqlx::SqlitePool;

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // Schema documents, one row per source identity. The bare version
    // column backs the compare-and-swap write.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schemas (
            source_id TEXT PRIMARY KEY,
            version INTEGER NOT NULL,
            document TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Append-only schema change history.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source_id TEXT NOT NULL,
            version INTEGER NOT NULL,
            entry TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Canonical records, keyed by source + shape.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS records (
            id TEXT PRIMARY KEY,
            source_id TEXT NOT NULL,
            shape TEXT NOT NULL,
            data TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            ingested_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Upload audit trail.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ingestion_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source_id TEXT NOT NULL,
            entry TEXT NOT NULL,
            timestamp TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Indexes
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_records_source_shape ON records(source_id, shape)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_history_source ON schema_history(source_id, version)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_log_source ON ingestion_log(source_id)")
        .execute(pool)
        .await?;

    Ok(())
}
