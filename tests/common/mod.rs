//! Fake engines and an in-memory run context shared by the integration
//! tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use anyhow::Result;
use async_trait::async_trait;
use casefile::config::{Config, TranslationMode};
use casefile::context::{stop_words, PipelineContext};
use casefile_core::entities::{LinkedSpan, ReferenceTable, SciModel};
use casefile_core::error::StageError;
use casefile_core::message::{InMemoryBus, MessageBus};
use casefile_core::models::DocTitle;
use casefile_core::services::{EntityLinker, OcrEngine, Redactor, Translator};
use casefile_core::store::memory::{
    InMemoryDocumentStore, InMemoryObjectStore, InMemoryStateStore, InMemoryWarehouse,
};
use casefile_core::store::{DocumentStore, ObjectStore, StateStore, Warehouse};
use regex::Regex;
use serde_json::json;

pub const BUCKET: &str = "casefile";

fn object_name(uri: &str) -> String {
    uri.strip_prefix(&format!("gs://{}/", BUCKET))
        .unwrap_or(uri)
        .to_string()
}

/// Writes one shard per `batch_size` pages. Scans without pages time out.
pub struct FakeOcr {
    objects: Arc<InMemoryObjectStore>,
    pages: HashMap<String, Vec<String>>,
}

impl FakeOcr {
    pub fn new(objects: Arc<InMemoryObjectStore>, pages: HashMap<String, Vec<String>>) -> Self {
        Self { objects, pages }
    }
}

#[async_trait]
impl OcrEngine for FakeOcr {
    async fn annotate_pdf(&self, source_uri: &str, dest_prefix_uri: &str, batch_size: u32) -> Result<()> {
        let source = object_name(source_uri);
        let Some(pages) = self.pages.get(&source) else {
            return Err(StageError::StageTimeout {
                stage: "ocr".to_string(),
                waited_secs: 180,
            }
            .into());
        };
        let prefix = object_name(dest_prefix_uri);
        for (i, batch) in pages.chunks(batch_size as usize).enumerate() {
            let first = i * batch_size as usize + 1;
            let last = first + batch.len() - 1;
            let responses: Vec<_> = batch
                .iter()
                .map(|text| json!({ "fullTextAnnotation": { "text": text } }))
                .collect();
            let body = json!({ "responses": responses }).to_string();
            self.objects
                .put(&format!("{}output-{}-to-{}.json", prefix, first, last), body);
        }
        Ok(())
    }
}

/// Word-by-word Italian to English using a fixed dictionary.
pub struct FakeTranslator {
    objects: Arc<InMemoryObjectStore>,
    pub calls: AtomicUsize,
}

pub fn translate_words(text: &str) -> String {
    const WORDS: [(&str, &str); 7] = [
        ("Paziente", "Patient"),
        ("visitato", "visited"),
        ("il", "on"),
        ("lesione", "lesion"),
        ("febbre", "fever"),
        ("brividi", "chills"),
        ("tosse", "cough"),
    ];
    text.split(' ')
        .map(|token| {
            let core = token.trim_end_matches(['.', ',']);
            let tail = &token[core.len()..];
            let english = WORDS
                .iter()
                .find(|(it, _)| *it == core)
                .map(|(_, en)| *en)
                .unwrap_or(core);
            format!("{}{}", english, tail)
        })
        .collect::<Vec<_>>()
        .join(" ")
}

impl FakeTranslator {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Translator for FakeTranslator {
    async fn translate_text(&self, text: &str, _source: &str, _target: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(translate_words(text))
    }

    async fn batch_translate(
        &self,
        input_uri: &str,
        output_prefix_uri: &str,
        _source: &str,
        _target: &str,
    ) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let input = object_name(input_uri);
        let text = self.objects.read_text(&input).await?;
        let title = DocTitle::from_blob_name(&input)?;
        let name = format!(
            "{}{}_raw_txt_{}_en_translations.txt",
            object_name(output_prefix_uri),
            BUCKET,
            title
        );
        self.objects.put(&name, translate_words(&text));
        Ok(())
    }
}

const SURNAMES: [&str; 2] = ["Rossi", "Bianchi"];

fn rot13(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            'a'..='z' => (((c as u8 - b'a') + 13) % 26 + b'a') as char,
            'A'..='Z' => (((c as u8 - b'A') + 13) % 26 + b'A') as char,
            _ => c,
        })
        .collect()
}

fn surrogate_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"REDACTED\((\d+)\):([A-Za-z]+)").unwrap())
}

/// Reversible stand-in for format-preserving encryption: known surnames
/// become `REDACTED(len):rot13(name)`.
pub struct FakeRedactor;

#[async_trait]
impl Redactor for FakeRedactor {
    async fn deidentify(&self, text: &str) -> Result<String> {
        let mut out = text.to_string();
        for name in SURNAMES {
            out = out.replace(name, &format!("REDACTED({}):{}", name.len(), rot13(name)));
        }
        Ok(out)
    }

    async fn reidentify(&self, text: &str) -> Result<String> {
        Ok(surrogate_pattern()
            .replace_all(text, |caps: &regex::Captures| rot13(&caps[2]))
            .into_owned())
    }
}

/// Links a handful of clinical words to structured concepts.
pub struct FakeLinker;

#[async_trait]
impl EntityLinker for FakeLinker {
    fn model(&self) -> SciModel {
        SciModel::CoreSciSm
    }

    async fn link(&self, text: &str) -> Result<Vec<LinkedSpan>> {
        Ok(text
            .split_whitespace()
            .filter_map(|word| {
                let concept = match word {
                    "fever" => json!({ "cui": "C0015967", "types": ["T184"] }),
                    "chills" => json!({ "cui": "C0085593", "types": ["T184"] }),
                    "cough" => json!({ "cui": "C0010200", "types": ["T184"] }),
                    "lesion" => json!("CUI: C0221198, Name: Lesion TUI(s): T033"),
                    "Patient" => json!({ "cui": "C0030705" }),
                    _ => return None,
                };
                Some(LinkedSpan {
                    text: word.to_string(),
                    concept: Some(concept),
                })
            })
            .collect())
    }
}

pub fn reference_table() -> ReferenceTable {
    ReferenceTable::from_pairs([("T184", "Sign or Symptom"), ("T033", "Finding")])
}

pub struct Harness {
    pub objects: Arc<InMemoryObjectStore>,
    pub warehouse: Arc<InMemoryWarehouse>,
    pub docstore: Arc<InMemoryDocumentStore>,
    pub state: Arc<InMemoryStateStore>,
    pub bus: Arc<InMemoryBus>,
    pub translator: Arc<FakeTranslator>,
    pub ctx: PipelineContext,
}

pub struct HarnessOptions {
    pub mode: TranslationMode,
    pub redaction: bool,
    pub linker: bool,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            mode: TranslationMode::Batch,
            redaction: false,
            linker: false,
        }
    }
}

/// Scans and their OCR pages.
pub fn sample_pages() -> HashMap<String, Vec<String>> {
    let mut pages = HashMap::new();
    pages.insert(
        "pdf/case1.pdf".to_string(),
        vec![
            "Paziente Rossi visitato il 3/4/2020.".to_string(),
            "Figure 1 lesione.".to_string(),
            "febbre brividi.".to_string(),
        ],
    );
    pages.insert(
        "pdf/case2.pdf".to_string(),
        vec!["febbre brividi febbre.".to_string()],
    );
    pages.insert("pdf/case3.pdf".to_string(), vec!["tosse.".to_string()]);
    pages
}

impl Harness {
    pub fn new(opts: HarnessOptions) -> Self {
        Self::with_pages(opts, sample_pages())
    }

    pub fn with_pages(opts: HarnessOptions, pages: HashMap<String, Vec<String>>) -> Self {
        let objects = Arc::new(InMemoryObjectStore::new(BUCKET));
        objects.put("pdf/", "");
        for name in pages.keys() {
            objects.put(name, format!("%PDF-1.4 {}", name));
        }

        let mut config = Config::minimal();
        config.engines.ocr_batch_size = 2;
        config.engines.translation_mode = opts.mode;
        config.redaction.enabled = opts.redaction;
        config.pipeline.stop_words = Some(vec!["on".to_string()]);

        let warehouse = Arc::new(InMemoryWarehouse::new());
        let docstore = Arc::new(InMemoryDocumentStore::new());
        let state = Arc::new(InMemoryStateStore::new());
        let bus = Arc::new(InMemoryBus::new());
        let translator = Arc::new(FakeTranslator {
            objects: objects.clone(),
            calls: AtomicUsize::new(0),
        });

        let redactor: Option<Arc<dyn Redactor>> = if opts.redaction {
            Some(Arc::new(FakeRedactor))
        } else {
            None
        };
        let linker: Option<Arc<dyn EntityLinker>> = if opts.linker {
            Some(Arc::new(FakeLinker))
        } else {
            None
        };

        let ctx = PipelineContext {
            stop_words: Arc::new(stop_words(&config)),
            config: Arc::new(config),
            objects: objects.clone() as Arc<dyn ObjectStore>,
            ocr: Arc::new(FakeOcr::new(objects.clone(), pages)),
            translator: translator.clone() as Arc<dyn Translator>,
            redactor,
            linker,
            warehouse: warehouse.clone() as Arc<dyn Warehouse>,
            docstore: docstore.clone() as Arc<dyn DocumentStore>,
            state: state.clone() as Arc<dyn StateStore>,
            bus: Some(bus.clone() as Arc<dyn MessageBus>),
            reference: Arc::new(reference_table()),
        };

        Self {
            objects,
            warehouse,
            docstore,
            state,
            bus,
            translator,
            ctx,
        }
    }
}
