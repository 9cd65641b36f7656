//! Per-document processing state.
//!
//! Each document moves through
//! `Discovered → Ocred → TextExtracted → Translated → Curated → Redacted →
//! EntitiesExtracted → Stored`. A [`ProcessingState`] records which
//! [`Step`]s have completed, keyed by document title and tied to a hash of
//! the source scan, so a re-run skips finished work and a replaced scan is
//! reprocessed from the start.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::StageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Discovered,
    Ocred,
    TextExtracted,
    Translated,
    Curated,
    Redacted,
    EntitiesExtracted,
    Stored,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Discovered => "discovered",
            Stage::Ocred => "ocred",
            Stage::TextExtracted => "text_extracted",
            Stage::Translated => "translated",
            Stage::Curated => "curated",
            Stage::Redacted => "redacted",
            Stage::EntitiesExtracted => "entities_extracted",
            Stage::Stored => "stored",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work that moves a document forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Step {
    Ocr,
    ExtractText,
    Translate,
    Curate,
    Redact,
    ExtractEntities,
    StoreWarehouse,
    StoreDocstore,
}

impl Step {
    pub const ALL: [Step; 8] = [
        Step::Ocr,
        Step::ExtractText,
        Step::Translate,
        Step::Curate,
        Step::Redact,
        Step::ExtractEntities,
        Step::StoreWarehouse,
        Step::StoreDocstore,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Ocr => "ocr",
            Step::ExtractText => "extract-text",
            Step::Translate => "translate",
            Step::Curate => "curate",
            Step::Redact => "redact",
            Step::ExtractEntities => "entities",
            Step::StoreWarehouse => "store-warehouse",
            Step::StoreDocstore => "store-docstore",
        }
    }

    /// Stage a document has reached once this step completes.
    pub fn reaches(&self) -> Stage {
        match self {
            Step::Ocr => Stage::Ocred,
            Step::ExtractText => Stage::TextExtracted,
            Step::Translate => Stage::Translated,
            Step::Curate => Stage::Curated,
            Step::Redact => Stage::Redacted,
            Step::ExtractEntities => Stage::EntitiesExtracted,
            Step::StoreWarehouse | Step::StoreDocstore => Stage::Stored,
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Step {
    type Err = StageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Step::ALL
            .into_iter()
            .find(|step| step.as_str() == s)
            .ok_or_else(|| StageError::Configuration(format!("unknown step '{}'", s)))
    }
}

/// Which sinks a run writes to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkSelection {
    pub warehouse: bool,
    pub docstore: bool,
}

/// SHA-256 over the source blob's name and backend fingerprint.
pub fn content_hash(name: &str, fingerprint: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update([0u8]);
    hasher.update(fingerprint.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingState {
    pub doc_title: String,
    pub content_hash: String,
    pub completed: BTreeSet<Step>,
    pub updated_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl ProcessingState {
    pub fn new(doc_title: impl Into<String>, content_hash: impl Into<String>) -> Self {
        Self {
            doc_title: doc_title.into(),
            content_hash: content_hash.into(),
            completed: BTreeSet::new(),
            updated_at: Utc::now(),
            last_error: None,
        }
    }

    /// Furthest stage reached by any completed step. Redaction is optional,
    /// so a document can be `Stored` without having been `Redacted`.
    pub fn stage(&self) -> Stage {
        self.completed
            .iter()
            .map(Step::reaches)
            .max()
            .unwrap_or(Stage::Discovered)
    }

    /// Forget completed steps when the source scan changed.
    /// Returns `true` when a reset happened.
    pub fn reset_if_changed(&mut self, content_hash: &str) -> bool {
        if self.content_hash == content_hash {
            return false;
        }
        self.content_hash = content_hash.to_string();
        self.completed.clear();
        self.last_error = None;
        self.updated_at = Utc::now();
        true
    }

    pub fn is_done(&self, step: Step) -> bool {
        self.completed.contains(&step)
    }

    /// Steps still required for this document, in execution order.
    pub fn plan(&self, sinks: SinkSelection, redaction_enabled: bool) -> Vec<Step> {
        required_steps(sinks, redaction_enabled)
            .into_iter()
            .filter(|step| !self.is_done(*step))
            .collect()
    }

    pub fn complete(&mut self, step: Step) {
        self.completed.insert(step);
        self.last_error = None;
        self.updated_at = Utc::now();
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.last_error = Some(message.into());
        self.updated_at = Utc::now();
    }
}

/// Every step a run performs for the given sinks, in execution order.
pub fn required_steps(sinks: SinkSelection, redaction_enabled: bool) -> Vec<Step> {
    let mut steps = vec![Step::Ocr, Step::ExtractText, Step::Translate, Step::Curate];
    if redaction_enabled {
        steps.push(Step::Redact);
    }
    if sinks.docstore {
        steps.push(Step::ExtractEntities);
    }
    if sinks.warehouse {
        steps.push(Step::StoreWarehouse);
    }
    if sinks.docstore {
        steps.push(Step::StoreDocstore);
    }
    steps
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOTH: SinkSelection = SinkSelection {
        warehouse: true,
        docstore: true,
    };

    #[test]
    fn test_full_plan_order() {
        let state = ProcessingState::new("case1", "h");
        assert_eq!(state.plan(BOTH, true), Step::ALL.to_vec());
    }

    #[test]
    fn test_plan_without_sinks_or_redaction() {
        let state = ProcessingState::new("case1", "h");
        assert_eq!(
            state.plan(SinkSelection::default(), false),
            vec![Step::Ocr, Step::ExtractText, Step::Translate, Step::Curate]
        );
    }

    #[test]
    fn test_plan_skips_completed() {
        let mut state = ProcessingState::new("case1", "h");
        state.complete(Step::Ocr);
        state.complete(Step::ExtractText);
        let plan = state.plan(
            SinkSelection {
                warehouse: true,
                docstore: false,
            },
            false,
        );
        assert_eq!(plan, vec![Step::Translate, Step::Curate, Step::StoreWarehouse]);
        assert_eq!(state.stage(), Stage::TextExtracted);
    }

    #[test]
    fn test_stage_reaches_stored() {
        let mut state = ProcessingState::new("case1", "h");
        assert_eq!(state.stage(), Stage::Discovered);
        for step in Step::ALL {
            state.complete(step);
        }
        assert_eq!(state.stage(), Stage::Stored);
        assert!(state.plan(BOTH, true).is_empty());
    }

    #[test]
    fn test_reset_on_new_content() {
        let mut state = ProcessingState::new("case1", content_hash("pdf/case1.pdf", "a"));
        state.complete(Step::Ocr);
        assert!(!state.reset_if_changed(&content_hash("pdf/case1.pdf", "a")));
        assert!(state.is_done(Step::Ocr));
        assert!(state.reset_if_changed(&content_hash("pdf/case1.pdf", "b")));
        assert!(state.completed.is_empty());
    }

    #[test]
    fn test_fail_then_complete_clears_error() {
        let mut state = ProcessingState::new("case1", "h");
        state.fail("missing blob: raw_txt/case1.txt");
        assert!(state.last_error.is_some());
        state.complete(Step::ExtractText);
        assert!(state.last_error.is_none());
    }

    #[test]
    fn test_step_names_round_trip() {
        for step in Step::ALL {
            assert_eq!(step.as_str().parse::<Step>().unwrap(), step);
        }
        assert!("upload".parse::<Step>().is_err());
    }
}
