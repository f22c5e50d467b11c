//! # Schemaflow CLI (`sfl`)
//!
//! The `sfl` binary ingests mixed-format documents and manages the
//! resulting schemas and records.
//!
//! ## Usage
//!
//! ```bash
//! sfl --config ./config/sfl.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `sfl init` | Create the SQLite database and run schema migrations |
//! | `sfl ingest <source> <file>` | Run a document through the pipeline |
//! | `sfl schema <source>` | Print the current schema document |
//! | `sfl history <source>` | Print schema history and the ingestion log |
//! | `sfl records <source> <shape>` | Print stored canonical records |

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use schemaflow::config::load_config;
use schemaflow::ingest::Pipeline;
use schemaflow::models::ShapeKind;
use schemaflow::oracle::create_oracle;
use schemaflow::store::{SchemaStore, SqliteStore};
use schemaflow::{db, migrate};

/// Schemaflow CLI — extract structured fragments from mixed-format text
/// and evolve a versioned schema per source.
#[derive(Parser)]
#[command(name = "sfl", version, about)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true, default_value = "config/sfl.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database and run migrations.
    Init,
    /// Ingest one document for a source identity.
    Ingest {
        /// Logical source identity owning the schema.
        source_id: String,
        /// Document to ingest (.txt, .md, or .pdf).
        file: PathBuf,
    },
    /// Print the current schema document for a source.
    Schema { source_id: String },
    /// Print schema version history and the ingestion log for a source.
    History { source_id: String },
    /// Print stored canonical records for a source and shape kind.
    Records {
        source_id: String,
        /// Shape kind: json, tabular, markup-table, or xml.
        shape: String,
        /// Maximum number of records to print.
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "schemaflow=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&config.db).await?;
            migrate::run_migrations(&pool).await?;
            pool.close().await;
            println!("initialized {}", config.db.path.display());
        }
        Commands::Ingest { source_id, file } => {
            let pool = db::connect(&config.db).await?;
            migrate::run_migrations(&pool).await?;
            let store = Arc::new(SqliteStore::new(pool));

            let mut pipeline = Pipeline::new(store).with_conflict_retries(config.ingest.conflict_retries);
            if config.oracle.is_enabled() {
                let oracle = create_oracle(&config.oracle)?;
                pipeline = pipeline
                    .with_oracle(oracle, Duration::from_secs(config.oracle.timeout_secs));
            }

            let result = pipeline.ingest_file(&source_id, &file).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Schema { source_id } => {
            let pool = db::connect(&config.db).await?;
            let store = SqliteStore::new(pool);
            match store.get_schema(&source_id).await? {
                Some(doc) => println!("{}", serde_json::to_string_pretty(&doc)?),
                None => bail!("no schema found for source '{}'", source_id),
            }
        }
        Commands::History { source_id } => {
            let pool = db::connect(&config.db).await?;
            let store = SqliteStore::new(pool);
            let history = store.get_history(&source_id).await?;
            let log = store.get_ingestion_log(&source_id).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "schema_history": history,
                    "ingestion_log": log,
                }))?
            );
        }
        Commands::Records {
            source_id,
            shape,
            limit,
        } => {
            let Some(kind) = ShapeKind::from_str_opt(&shape) else {
                bail!("unknown shape kind: '{}'. Must be json, tabular, markup-table, or xml.", shape);
            };
            let pool = db::connect(&config.db).await?;
            let store = SqliteStore::new(pool);
            let records = store.get_records(&source_id, kind, limit).await?;
            for record in records {
                println!("{}", serde_json::to_string(&record)?);
            }
        }
    }

    Ok(())
}
