//! External engines the pipeline calls.
//!
//! Each trait is the narrow contract one stage needs. Implementations
//! live in the application crate (REST adapters) and in tests (fakes).

use anyhow::Result;
use async_trait::async_trait;

use crate::entities::{LinkedSpan, SciModel};

/// Asynchronous document text detection.
#[async_trait]
pub trait OcrEngine: Send + Sync {
    /// Annotate the PDF at `source_uri`, writing response shards under
    /// `dest_prefix_uri` with at most `batch_size` pages each. Returns once
    /// the shards are written or fails with `StageTimeout`.
    async fn annotate_pdf(&self, source_uri: &str, dest_prefix_uri: &str, batch_size: u32)
        -> Result<()>;
}

#[async_trait]
pub trait Translator: Send + Sync {
    /// Translate `text` and return the result.
    async fn translate_text(&self, text: &str, source: &str, target: &str) -> Result<String>;

    /// Translate the `text/plain` blob at `input_uri`, writing output
    /// shards under `output_prefix_uri`. Returns once the job completes
    /// or fails with `StageTimeout`.
    async fn batch_translate(
        &self,
        input_uri: &str,
        output_prefix_uri: &str,
        source: &str,
        target: &str,
    ) -> Result<()>;
}

/// Deterministic, reversible redaction of personal identifiers.
#[async_trait]
pub trait Redactor: Send + Sync {
    async fn deidentify(&self, text: &str) -> Result<String>;

    /// Inverse of [`deidentify`](Redactor::deidentify) under the same key
    /// and surrogate.
    async fn reidentify(&self, text: &str) -> Result<String>;
}

/// Biomedical named-entity recognition with concept linking.
#[async_trait]
pub trait EntityLinker: Send + Sync {
    fn model(&self) -> SciModel;

    async fn link(&self, text: &str) -> Result<Vec<LinkedSpan>>;
}
