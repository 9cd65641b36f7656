//! Text cleaning for translated case reports.
//!
//! [`clean_text`] applies, in order:
//!
//! 1. removal of `D/D/YYYY` dates (one or two digit day and month),
//! 2. removal of `Figure N` captions,
//! 3. removal of lines that consist exactly of `Image X`,
//! 4. collapse of every run of non-alphanumeric ASCII characters to one space,
//! 5. whitespace tokenization with exact, case-sensitive stop-word removal,
//! 6. rejoin with a single space *before* each token.
//!
//! Step 6 means non-empty output always starts with a space. Callers that
//! compare output must account for it.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;

pub type StopWords = HashSet<String>;

/// Curated stop words for the Italian case-report corpus: institution and
/// author names, translation residue, and single-letter OCR fragments.
pub const DEFAULT_STOP_WORDS: &[&str] = &[
    "uoc",
    "diagnostic",
    "interventional",
    "radiology",
    "madonna",
    "delle",
    "grazie",
    "hospital",
    "Borgheresi",
    "Agostini",
    "Ottaviani",
    "Floridi",
    "Giovagnoni",
    "di",
    "specialization",
    "Polytechnic",
    "University",
    "marche",
    "ANCONA",
    "Italy",
    "Azienda",
    "Ospedali",
    "Riuniti",
    "Yorrette",
    "Matera",
    "Michele",
    "Nardella",
    "Gerardo",
    "Costanzo",
    "Claudia",
    "Lopez",
    "st",
    "a.",
    "a",
    "of",
    "s",
    "cien",
    "ze",
    "diolog",
    "ic",
    "he",
    "â",
    "€",
    "b",
    "case",
    "Cuoladi",
    "l",
    "c",
    "ra",
    "bergamo",
    "patelli",
    "est",
    "asst",
    "dr",
    "Dianluigi",
    "Svizzero",
    "i",
    "riccardo",
    "Alessandro",
    "Spinazzola",
    "angelo",
    "maggiore",
    "p",
    "r",
    "t",
    "m",
    "en",
    "o",
    "d",
    "e",
    "n",
    "g",
    "h",
    "u",
];

pub fn default_stop_words() -> StopWords {
    DEFAULT_STOP_WORDS.iter().map(|w| w.to_string()).collect()
}

/// Build a stop-word set from any list of words.
pub fn stop_words_from<I, S>(words: I) -> StopWords
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    words.into_iter().map(Into::into).collect()
}

struct Patterns {
    date: Regex,
    figure: Regex,
    image_line: Regex,
    non_alnum: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        date: Regex::new(r"\d{1,2}/\d{1,2}/\d{4}").unwrap(),
        figure: Regex::new(r"Figure \d{1,2}").unwrap(),
        image_line: Regex::new(r"(?m)^Image .$").unwrap(),
        non_alnum: Regex::new(r"[^A-Za-z0-9]+").unwrap(),
    })
}

/// Remove punctuation and formatting noise, leaving tokens separated by
/// single spaces. Applying it twice gives the same result as once.
pub fn strip_punctuation(text: &str) -> String {
    patterns().non_alnum.replace_all(text, " ").into_owned()
}

/// Clean `raw` and drop every token contained in `stop_words`.
pub fn clean_text(raw: &str, stop_words: &StopWords) -> String {
    let p = patterns();
    let text = p.date.replace_all(raw, "");
    let text = p.figure.replace_all(&text, "");
    let text = p.image_line.replace_all(&text, "");
    let text = strip_punctuation(&text);

    let mut out = String::with_capacity(text.len());
    for token in text.split_whitespace() {
        if stop_words.contains(token) {
            continue;
        }
        out.push(' ');
        out.push_str(token);
    }
    out
}
