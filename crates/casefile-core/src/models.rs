//! Core data models shared by every pipeline stage.
//!
//! A case report is identified by its [`DocTitle`] from the moment its PDF
//! lands under `pdf/` until its entities reach the document store. Every
//! intermediate artifact is a blob whose name is derived from that title
//! (see [`crate::layout`]).

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StageError;

/// Stable identifier of a case report.
///
/// Derived from the source file name: the last path segment, truncated at
/// the first `.` or `-`. `pdf/case14.pdf`, `json/case14-output-1-to-2.json`
/// and `raw_txt/case14.txt` all map to `case14`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocTitle(String);

impl DocTitle {
    /// Wrap an already-derived title. Rejects empty strings and titles that
    /// contain a path separator.
    pub fn new(title: impl Into<String>) -> Result<Self, StageError> {
        let title = title.into();
        if title.is_empty() || title.contains('/') {
            return Err(StageError::Configuration(format!(
                "invalid document title: '{}'",
                title
            )));
        }
        Ok(Self(title))
    }

    /// Derive the title from any blob name produced for this document.
    pub fn from_blob_name(name: &str) -> Result<Self, StageError> {
        let file = name.rsplit('/').next().unwrap_or(name);
        let stem = file.split(['.', '-']).next().unwrap_or_default();
        Self::new(stem)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocTitle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for DocTitle {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// One row of the warehouse table. All four columns are required strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarehouseRow {
    pub case: String,
    pub it_raw_txt: String,
    pub eng_raw_txt: String,
    pub eng_txt: String,
}

/// Column names of the warehouse table, in schema order.
pub const WAREHOUSE_COLUMNS: [&str; 4] = ["case", "it_raw_txt", "eng_raw_txt", "eng_txt"];

/// Entity category (e.g. `"Sign or Symptom"`) to the surface strings found
/// for it, in extraction order.
pub type CategoryMap = BTreeMap<String, Vec<String>>;

/// Conjunctive equality filter: every listed value must be present under
/// its field.
pub type CaseFilter = BTreeMap<String, Vec<String>>;

/// A document-store record: kind `case`, keyed by document title.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseRecord {
    pub doc_title: String,
    pub entities: CategoryMap,
}

impl CaseRecord {
    /// True when, for every field in `filter`, each requested value appears
    /// in this record's list under that field.
    pub fn matches(&self, filter: &CaseFilter) -> bool {
        filter.iter().all(|(field, values)| {
            self.entities
                .get(field)
                .map(|found| values.iter().all(|v| found.contains(v)))
                .unwrap_or(false)
        })
    }
}

/// Listing entry returned by an object store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlobMeta {
    pub name: String,
    pub size: u64,
    /// Backend-specific content fingerprint (md5, generation, or SHA-256).
    pub fingerprint: String,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Result of an idempotent create-or-get call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ensured {
    pub id: String,
    /// `true` only when this call created the resource.
    pub created: bool,
}
