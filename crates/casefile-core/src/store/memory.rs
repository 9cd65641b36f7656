//! In-memory store implementations for tests and dry runs.
//!
//! Collections live behind `std::sync::RwLock`. The warehouse counts the
//! datasets and tables it actually created so idempotency is observable.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};

use crate::error::StageError;
use crate::models::{BlobMeta, CaseFilter, CaseRecord, CategoryMap, Ensured, WarehouseRow};
use crate::state::ProcessingState;

use super::{DocumentStore, ObjectStore, StateStore, Warehouse};

/// Bucket held in a sorted map, so listings come back ordered by name.
pub struct InMemoryObjectStore {
    bucket: String,
    blobs: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl InMemoryObjectStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            blobs: RwLock::new(BTreeMap::new()),
        }
    }

    /// Insert a blob synchronously. Handy for seeding fixtures.
    pub fn put(&self, name: &str, content: impl AsRef<[u8]>) {
        self.blobs
            .write()
            .unwrap()
            .insert(name.to_string(), content.as_ref().to_vec());
    }

    pub fn remove(&self, name: &str) -> bool {
        self.blobs.write().unwrap().remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.blobs.read().unwrap().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.blobs.read().unwrap().keys().cloned().collect()
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BlobMeta>> {
        let blobs = self.blobs.read().unwrap();
        Ok(blobs
            .range(prefix.to_string()..)
            .take_while(|(name, _)| name.starts_with(prefix))
            .map(|(name, content)| BlobMeta {
                name: name.clone(),
                size: content.len() as u64,
                fingerprint: hex::encode(Sha256::digest(content)),
                updated_at: None,
            })
            .collect())
    }

    async fn read(&self, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.read().unwrap().get(name).cloned())
    }

    async fn write(&self, name: &str, content: &[u8], _content_type: &str) -> Result<()> {
        self.put(name, content);
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        Ok(self.remove(name))
    }
}

#[derive(Default)]
struct WarehouseState {
    datasets: BTreeSet<String>,
    tables: BTreeSet<(String, String)>,
    rows: Vec<(String, String, WarehouseRow)>,
    creations: usize,
}

#[derive(Default)]
pub struct InMemoryWarehouse {
    inner: RwLock<WarehouseState>,
}

impl InMemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of datasets and tables created so far.
    pub fn creations(&self) -> usize {
        self.inner.read().unwrap().creations
    }

    pub fn rows(&self) -> Vec<WarehouseRow> {
        self.inner
            .read()
            .unwrap()
            .rows
            .iter()
            .map(|(_, _, row)| row.clone())
            .collect()
    }
}

#[async_trait]
impl Warehouse for InMemoryWarehouse {
    async fn ensure_dataset(&self, dataset: &str) -> Result<Ensured> {
        let mut inner = self.inner.write().unwrap();
        let created = inner.datasets.insert(dataset.to_string());
        if created {
            inner.creations += 1;
        }
        Ok(Ensured {
            id: dataset.to_string(),
            created,
        })
    }

    async fn ensure_table(&self, dataset: &str, table: &str) -> Result<Ensured> {
        let mut inner = self.inner.write().unwrap();
        if !inner.datasets.contains(dataset) {
            return Err(StageError::engine("warehouse", 404, format!("dataset {} not found", dataset)).into());
        }
        let created = inner
            .tables
            .insert((dataset.to_string(), table.to_string()));
        if created {
            inner.creations += 1;
        }
        Ok(Ensured {
            id: format!("{}.{}", dataset, table),
            created,
        })
    }

    async fn insert_row(&self, dataset: &str, table: &str, row: &WarehouseRow) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        if !inner
            .tables
            .contains(&(dataset.to_string(), table.to_string()))
        {
            return Err(StageError::engine(
                "warehouse",
                404,
                format!("table {}.{} not found", dataset, table),
            )
            .into());
        }
        inner
            .rows
            .push((dataset.to_string(), table.to_string(), row.clone()));
        Ok(())
    }

    async fn find_case(
        &self,
        dataset: &str,
        table: &str,
        case: &str,
    ) -> Result<Option<WarehouseRow>> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .rows
            .iter()
            .find(|(d, t, row)| d == dataset && t == table && row.case == case)
            .map(|(_, _, row)| row.clone()))
    }
}

/// Records kept in first-insertion order; an upsert replaces in place.
#[derive(Default)]
pub struct InMemoryDocumentStore {
    records: RwLock<Vec<CaseRecord>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn upsert_entities(&self, doc_title: &str, entities: &CategoryMap) -> Result<()> {
        let mut records = self.records.write().unwrap();
        let record = CaseRecord {
            doc_title: doc_title.to_string(),
            entities: entities.clone(),
        };
        match records.iter_mut().find(|r| r.doc_title == doc_title) {
            Some(existing) => *existing = record,
            None => records.push(record),
        }
        Ok(())
    }

    async fn get(&self, doc_title: &str) -> Result<Option<CaseRecord>> {
        Ok(self
            .records
            .read()
            .unwrap()
            .iter()
            .find(|r| r.doc_title == doc_title)
            .cloned())
    }

    async fn query(&self, filter: &CaseFilter, limit: usize) -> Result<Vec<CaseRecord>> {
        Ok(self
            .records
            .read()
            .unwrap()
            .iter()
            .filter(|r| r.matches(filter))
            .take(limit)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct InMemoryStateStore {
    states: RwLock<BTreeMap<String, ProcessingState>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn load(&self, doc_title: &str) -> Result<Option<ProcessingState>> {
        Ok(self.states.read().unwrap().get(doc_title).cloned())
    }

    async fn save(&self, state: &ProcessingState) -> Result<()> {
        let mut stored = state.clone();
        stored.updated_at = Utc::now();
        self.states
            .write()
            .unwrap()
            .insert(state.doc_title.clone(), stored);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ProcessingState>> {
        Ok(self.states.read().unwrap().values().cloned().collect())
    }
}
