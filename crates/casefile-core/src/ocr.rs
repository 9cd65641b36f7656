//! OCR response shards.
//!
//! The OCR engine writes one JSON file per page batch, named
//! `json/{title}-output-{first}-to-{last}.json`. Each file holds an
//! `AnnotateFileResponse`; only the full-text annotation of every page is
//! kept.

use std::sync::OnceLock;

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AnnotateFileResponse {
    #[serde(default)]
    pub responses: Vec<PageResponse>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PageResponse {
    #[serde(default)]
    pub full_text_annotation: Option<TextAnnotation>,
}

#[derive(Debug, Deserialize, Default)]
pub struct TextAnnotation {
    #[serde(default)]
    pub text: String,
}

pub fn parse_shard(bytes: &[u8]) -> Result<AnnotateFileResponse> {
    serde_json::from_slice(bytes).context("Failed to parse OCR response shard")
}

/// Page range encoded in a shard name, if any.
pub fn shard_sequence(name: &str) -> Option<(u32, u32)> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"output-(\d+)-to-(\d+)\.json$").unwrap());
    let caps = re.captures(name)?;
    let first = caps[1].parse().ok()?;
    let last = caps[2].parse().ok()?;
    Some((first, last))
}

/// Sort shard names by the first page they cover. Lexicographic listing
/// order puts `output-21-to-40` before `output-3-to-20`; this does not.
/// Names without a page range sort after numbered ones, by name.
pub fn order_shards(names: &mut [String]) {
    names.sort_by(|a, b| match (shard_sequence(a), shard_sequence(b)) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => a.cmp(b),
    });
}

/// Append every page's text to `out`, each followed by a single space.
/// Pages with no detected text contribute only the separator.
pub fn append_pages(response: &AnnotateFileResponse, out: &mut String) {
    for page in &response.responses {
        if let Some(annotation) = &page.full_text_annotation {
            out.push_str(&annotation.text);
        }
        out.push(' ');
    }
}

/// Concatenate the page text of already-ordered shards.
pub fn concatenate_pages<'a, I>(shards: I) -> Result<String>
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut text = String::new();
    for bytes in shards {
        let response = parse_shard(bytes)?;
        append_pages(&response, &mut text);
    }
    Ok(text)
}
