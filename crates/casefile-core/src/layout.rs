//! Object-store naming conventions.
//!
//! | Prefix | Contents |
//! |--------|----------|
//! | `pdf/` | source scans |
//! | `json/{title}-` | OCR response shards |
//! | `raw_txt/{title}.txt` | Italian text extracted from OCR |
//! | `eng_txt/{title}.txt` | English translation (synchronous mode) |
//! | `eng_txt/{title}/…_en_translations.txt` | English translation (batch mode) |
//! | `curated_eng_txt/{title}.txt` | cleaned English text |
//! | `redacted_raw_eng_txt/{title}.txt` | redacted English text |
//! | `entities/{title}.json` | extracted category map |

use crate::models::DocTitle;

pub const PDF_PREFIX: &str = "pdf/";
pub const OCR_PREFIX: &str = "json/";
pub const RAW_TEXT_PREFIX: &str = "raw_txt/";
pub const ENGLISH_PREFIX: &str = "eng_txt/";
pub const CURATED_PREFIX: &str = "curated_eng_txt/";
pub const REDACTED_PREFIX: &str = "redacted_raw_eng_txt/";
pub const ENTITIES_PREFIX: &str = "entities/";

const BATCH_SUFFIX: &str = "_en_translations.txt";

/// Prefix every OCR shard of `title` starts with.
pub fn ocr_prefix(title: &DocTitle) -> String {
    format!("{}{}-", OCR_PREFIX, title)
}

pub fn raw_text(title: &DocTitle) -> String {
    format!("{}{}.txt", RAW_TEXT_PREFIX, title)
}

pub fn english_text(title: &DocTitle) -> String {
    format!("{}{}.txt", ENGLISH_PREFIX, title)
}

/// Output directory for a batch translation of `title`.
pub fn english_batch_prefix(title: &DocTitle) -> String {
    format!("{}{}/", ENGLISH_PREFIX, title)
}

/// True for a translated-text shard written by a batch translation job.
pub fn is_batch_translation(name: &str) -> bool {
    name.ends_with(BATCH_SUFFIX)
}

pub fn curated_text(title: &DocTitle) -> String {
    format!("{}{}.txt", CURATED_PREFIX, title)
}

pub fn redacted_text(title: &DocTitle) -> String {
    format!("{}{}.txt", REDACTED_PREFIX, title)
}

pub fn entities(title: &DocTitle) -> String {
    format!("{}{}.json", ENTITIES_PREFIX, title)
}

/// `gs://bucket/name` URI handed to engines that read or write storage
/// directly.
pub fn gs_uri(bucket: &str, name: &str) -> String {
    format!("gs://{}/{}", bucket, name)
}

/// True for a listing entry that is a source scan rather than a
/// directory placeholder.
pub fn is_source_pdf(name: &str) -> bool {
    name.starts_with(PDF_PREFIX) && name.len() > PDF_PREFIX.len() && !name.ends_with('/')
}
