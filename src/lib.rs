//! # Schemaflow
//!
//! A pipeline for extracting structured data from mixed-format text and
//! evolving a versioned, self-describing schema per source.
//!
//! Schemaflow scans free-form documents for embedded fragments of
//! structured data (JSON values, delimited tabular blocks, markup tables,
//! generic XML), parses them into canonical records, and merges the
//! inferred shape of
//! each batch into a persistent, append-only schema history without data
//! loss or breaking changes for prior consumers.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌─────────┐   ┌───────────┐   ┌────────┐   ┌─────────┐
//! │ Fragment │──▶│  Shape  │──▶│ Canonical │──▶│ Schema │──▶│  Store  │
//! │ Detector │   │ Parsers │   │  -izer    │   │ Evolve │   │ SQLite/ │
//! └──────────┘   └─────────┘   └───────────┘   └────────┘   │ memory  │
//!      ▲                                                    └─────────┘
//!      │ advisory, timeout-bounded
//! ┌──────────┐
//! │  Oracle  │
//! └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! sfl init                          # create database
//! sfl ingest warehouse notes.txt    # extract + evolve schema
//! sfl schema warehouse              # current schema document
//! sfl history warehouse             # version history + upload log
//! sfl records warehouse json       # stored canonical records
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types and error taxonomy |
//! | [`detect`] | Fragment detection heuristics |
//! | [`parse`] | Per-shape fragment parsers |
//! | [`canonical`] | Field normalization, type inference, dedup |
//! | [`schema`] | Batch signature inference and schema evolution |
//! | [`store`] | Document store abstraction (SQLite, in-memory) |
//! | [`oracle`] | Advisory classification oracle |
//! | [`extract`] | File-to-text extraction for the CLI |
//! | [`ingest`] | Pipeline orchestration |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod canonical;
pub mod config;
pub mod db;
pub mod detect;
pub mod extract;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod oracle;
pub mod parse;
pub mod schema;
pub mod store;
