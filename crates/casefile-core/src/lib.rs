//! # casefile core
//!
//! I/O-free logic for the case-report pipeline: data models, the text
//! cleaning filter, blob naming, OCR shard parsing, entity categorisation,
//! the per-document state machine, bus messages, and the traits every
//! external service and store implements.
//!
//! No tokio, sqlx, or HTTP client lives here. In-memory stores and bus are
//! provided for tests.

pub mod clean;
pub mod entities;
pub mod error;
pub mod layout;
pub mod message;
pub mod models;
pub mod ocr;
pub mod services;
pub mod state;
pub mod store;
