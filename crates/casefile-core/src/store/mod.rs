//! Storage abstractions: the object store holding stage blobs, the two
//! result sinks, and the processing-state store.
//!
//! Implementations must be `Send + Sync`; the pipeline holds them as
//! `Arc<dyn ...>` inside its run context.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::error::StageError;
use crate::models::{BlobMeta, CaseFilter, CaseRecord, CategoryMap, Ensured, WarehouseRow};
use crate::state::ProcessingState;

/// A flat namespace of named blobs (one bucket).
#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn bucket(&self) -> &str;

    /// Location handed to engines that access storage directly.
    fn uri(&self, name: &str) -> String {
        crate::layout::gs_uri(self.bucket(), name)
    }

    /// Blobs whose name starts with `prefix`, ordered by name.
    async fn list(&self, prefix: &str) -> Result<Vec<BlobMeta>>;

    async fn read(&self, name: &str) -> Result<Option<Vec<u8>>>;

    async fn write(&self, name: &str, content: &[u8], content_type: &str) -> Result<()>;

    /// Remove a blob. Returns `false` when it did not exist.
    async fn delete(&self, name: &str) -> Result<bool>;

    /// Remove every blob under `prefix`. Returns how many were removed.
    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let mut removed = 0;
        for meta in self.list(prefix).await? {
            if self.delete(&meta.name).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Read a UTF-8 blob, failing with [`StageError::MissingBlob`] when absent.
    async fn read_text(&self, name: &str) -> Result<String> {
        let bytes = self
            .read(name)
            .await?
            .ok_or_else(|| StageError::MissingBlob(name.to_string()))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    async fn write_text(&self, name: &str, text: &str) -> Result<()> {
        self.write(name, text.as_bytes(), "text/plain; charset=utf-8")
            .await
    }
}

/// Relational sink: one append-only row per document.
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Create the dataset if it does not exist.
    async fn ensure_dataset(&self, dataset: &str) -> Result<Ensured>;

    /// Create the four-column table if it does not exist.
    async fn ensure_table(&self, dataset: &str, table: &str) -> Result<Ensured>;

    async fn insert_row(&self, dataset: &str, table: &str, row: &WarehouseRow) -> Result<()>;

    /// First row whose `case` column equals `case`.
    async fn find_case(&self, dataset: &str, table: &str, case: &str)
        -> Result<Option<WarehouseRow>>;
}

/// Keyed sink for entity maps. Kind is fixed per store.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Put by key; a second put for the same title replaces the first.
    async fn upsert_entities(&self, doc_title: &str, entities: &CategoryMap) -> Result<()>;

    async fn get(&self, doc_title: &str) -> Result<Option<CaseRecord>>;

    /// Records matching every `(field, value)` pair, at most `limit`, in
    /// store order.
    async fn query(&self, filter: &CaseFilter, limit: usize) -> Result<Vec<CaseRecord>>;
}

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self, doc_title: &str) -> Result<Option<ProcessingState>>;

    async fn save(&self, state: &ProcessingState) -> Result<()>;

    /// All states, ordered by title.
    async fn list(&self) -> Result<Vec<ProcessingState>>;
}
