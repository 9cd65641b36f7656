//! Medical entity categorisation.
//!
//! The linking engine returns, for every recognised span, the concept
//! record of its first candidate. The record carries a semantic type
//! identifier (`T` followed by three digits, e.g. `T184` for *Sign or
//! Symptom*). [`ReferenceTable`] maps type identifiers to the category
//! names used as document-store fields.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io::Read;
use std::str::FromStr;
use std::sync::OnceLock;

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::StageError;
use crate::models::CategoryMap;

/// Recognition model used by the linking engine. Resolved once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SciModel {
    #[serde(rename = "en_core_sci_sm")]
    CoreSciSm,
    #[serde(rename = "en_core_sci_lg")]
    CoreSciLg,
    #[serde(rename = "en_ner_bc5cdr_md")]
    NerBc5cdrMd,
}

impl SciModel {
    pub const ALL: [SciModel; 3] = [
        SciModel::CoreSciSm,
        SciModel::CoreSciLg,
        SciModel::NerBc5cdrMd,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SciModel::CoreSciSm => "en_core_sci_sm",
            SciModel::CoreSciLg => "en_core_sci_lg",
            SciModel::NerBc5cdrMd => "en_ner_bc5cdr_md",
        }
    }
}

impl fmt::Display for SciModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SciModel {
    type Err = StageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SciModel::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| {
                StageError::Configuration(format!(
                    "unknown model '{}'. Must be one of: en_core_sci_sm, en_core_sci_lg, en_ner_bc5cdr_md",
                    s
                ))
            })
    }
}

/// A recognised span and the concept record of its first linker candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkedSpan {
    pub text: String,
    #[serde(default)]
    pub concept: Option<serde_json::Value>,
}

fn tui_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"T\d{3}").unwrap())
}

/// Extract the semantic type identifier from a concept record.
///
/// Structured records with a `types` array are read directly. Anything
/// else is searched in its string form, the way a printed concept record
/// (`... TUI(s): T184 ...`) would be.
pub fn type_code(concept: &serde_json::Value) -> Option<String> {
    if let Some(types) = concept.get("types").and_then(|t| t.as_array()) {
        for t in types.iter().filter_map(|t| t.as_str()) {
            if let Some(m) = tui_pattern().find(t) {
                return Some(m.as_str().to_string());
            }
        }
    }
    let text = match concept {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    tui_pattern().find(&text).map(|m| m.as_str().to_string())
}

/// Semantic type identifier → category name.
#[derive(Debug, Clone, Default)]
pub struct ReferenceTable {
    categories: HashMap<String, String>,
}

impl ReferenceTable {
    /// Load from CSV. One column must be headed `TUIs`; the first other
    /// column holds the category name.
    pub fn from_csv<R: Read>(reader: R) -> Result<Self> {
        let mut rdr = csv::Reader::from_reader(reader);
        let headers = rdr.headers().context("Failed to read reference table header")?;
        let tui_col = headers
            .iter()
            .position(|h| h.trim() == "TUIs")
            .ok_or_else(|| anyhow::anyhow!("reference table has no 'TUIs' column"))?;
        let Some(cat_col) = (0..headers.len()).find(|&i| i != tui_col) else {
            bail!("reference table has no category column");
        };

        let mut categories = HashMap::new();
        for (line, record) in rdr.records().enumerate() {
            let record =
                record.with_context(|| format!("Bad reference table row {}", line + 2))?;
            let tui = record.get(tui_col).unwrap_or_default().trim();
            let category = record.get(cat_col).unwrap_or_default().trim();
            if tui.is_empty() || category.is_empty() {
                continue;
            }
            categories.insert(tui.to_string(), category.to_string());
        }
        Ok(Self { categories })
    }

    pub fn from_pairs<I, A, B>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (A, B)>,
        A: Into<String>,
        B: Into<String>,
    {
        Self {
            categories: pairs
                .into_iter()
                .map(|(a, b)| (a.into(), b.into()))
                .collect(),
        }
    }

    pub fn category(&self, tui: &str) -> Option<&str> {
        self.categories.get(tui).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.categories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }
}

/// Join linked spans with the reference table and group by category.
///
/// Spans without a concept, without a type identifier, or with an
/// identifier missing from the table are dropped. Within a category,
/// entities keep their extraction order. With `dedup`, a surface string is
/// kept only the first time it appears in a category.
pub fn group_by_category(spans: &[LinkedSpan], table: &ReferenceTable, dedup: bool) -> CategoryMap {
    let mut grouped = CategoryMap::new();
    let mut seen: HashSet<(String, String)> = HashSet::new();

    for span in spans {
        let Some(tui) = span.concept.as_ref().and_then(type_code) else {
            continue;
        };
        let Some(category) = table.category(&tui) else {
            continue;
        };
        if dedup && !seen.insert((category.to_string(), span.text.clone())) {
            continue;
        }
        grouped
            .entry(category.to_string())
            .or_default()
            .push(span.text.clone());
    }
    grouped
}
