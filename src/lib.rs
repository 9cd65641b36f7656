//! # casefile
//!
//! Ingestion pipeline for scanned COVID-19 case reports: OCR the PDFs,
//! translate the Italian text to English, clean and redact it, extract
//! medical entities, and load the results into a warehouse and a document
//! store.
//!
//! ## Architecture
//!
//! ```text
//! pdf/ ──▶ OCR ──▶ json/ ──▶ text ──▶ raw_txt/ ──▶ translate ──▶ eng_txt/
//!                                                                  │
//!        entities/ ◀── extract ◀── curated_eng_txt/ ◀── clean ◀────┘
//!            │                          │
//!            ▼                          ├──▶ redact ──▶ redacted_raw_eng_txt/
//!      document store                   ▼
//!                                   warehouse
//! ```
//!
//! Pure logic and the service traits live in `casefile-core`. This crate
//! holds the Google Cloud REST adapters, the SQLite-backed local sinks, the
//! batch driver, the event handlers and the CLI.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML + environment configuration |
//! | [`context`] | Run context holding every service handle |
//! | [`stages`] | One function per pipeline step |
//! | [`pipeline`] | Batch driver with resumable per-document state |
//! | [`trigger`] | Storage-event and bus-message handlers |
//! | [`server`] | HTTP endpoints for the event handlers |
//! | [`gcp`] | Authenticated REST client and long-running operations |
//! | [`db`] / [`migrate`] / [`sqlite_store`] | Local SQLite sinks and state |

pub mod bigquery;
pub mod blob_fs;
pub mod blob_gcs;
pub mod config;
pub mod context;
pub mod datastore;
pub mod db;
pub mod dlp;
pub mod gcp;
pub mod linker;
pub mod migrate;
pub mod pipeline;
pub mod progress;
pub mod pubsub;
pub mod query;
pub mod server;
pub mod sqlite_store;
pub mod stages;
pub mod status;
pub mod translate;
pub mod trigger;
pub mod vision;
