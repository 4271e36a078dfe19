//! Key matching rules
//!
//! A key is either a plain string or a delimiter-quoted regex such as
//! `/drag(on|ons)/i`. Plain keys honor case sensitivity and whole-word
//! settings; regex keys only honor their own flags.

use once_cell::sync::Lazy;
use once_cell::unsync::OnceCell;
use regex::{Regex, RegexBuilder};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

static REGEX_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^/(.+?)/([gimsuy]*)$").expect("regex key pattern is valid"));

static UNESCAPED_SLASH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|[^\\])/").expect("slash pattern is valid"));

/// Parse a `/pattern/flags` key into a regex.
///
/// Returns `None` for plain keys, for patterns containing an unescaped `/`,
/// and for patterns the regex engine rejects.
pub fn parse_regex_key(key: &str) -> Option<Regex> {
    let caps = REGEX_KEY.captures(key)?;
    let pattern = caps.get(1)?.as_str();
    let flags = caps.get(2).map_or("", |m| m.as_str());

    if UNESCAPED_SLASH.is_match(pattern) {
        return None;
    }
    let pattern = pattern.replace("\\/", "/");

    RegexBuilder::new(&pattern)
        .case_insensitive(flags.contains('i'))
        .multi_line(flags.contains('m'))
        .dot_matches_new_line(flags.contains('s'))
        .build()
        .ok()
}

/// Scan text plus its case-folded form, folded on first use
pub struct Haystack {
    raw: String,
    folded: OnceCell<String>,
}

impl Haystack {
    pub fn new(raw: impl Into<String>) -> Self {
        Self {
            raw: raw.into(),
            folded: OnceCell::new(),
        }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn folded(&self) -> &str {
        self.folded.get_or_init(|| self.raw.to_lowercase())
    }
}

type PatternCache = Mutex<HashMap<String, Option<Regex>>>;

/// Key matcher that compiles each regex key and word-boundary pattern once
#[derive(Debug, Default)]
pub struct KeyMatcher {
    regex_keys: PatternCache,
    word_bounds: PatternCache,
}

impl KeyMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `needle` occurs in `haystack` under the given matching rules
    pub fn is_match(
        &self,
        haystack: &Haystack,
        needle: &str,
        case_sensitive: bool,
        whole_words: bool,
    ) -> bool {
        if needle.is_empty() {
            return false;
        }
        if let Some(regex) = cached(&self.regex_keys, needle, || parse_regex_key(needle)) {
            return regex.is_match(haystack.raw());
        }

        let folded_needle;
        let (haystack, needle) = if case_sensitive {
            (haystack.raw(), needle)
        } else {
            folded_needle = needle.to_lowercase();
            (haystack.folded(), folded_needle.as_str())
        };

        // Phrases can't be bounded word by word, fall back to containment
        if !whole_words || needle.split_whitespace().count() > 1 {
            return haystack.contains(needle);
        }

        cached(&self.word_bounds, needle, || {
            Regex::new(&format!(r"(?:^|\W){}(?:$|\W)", regex::escape(needle))).ok()
        })
        .is_some_and(|re| re.is_match(haystack))
    }
}

fn cached(cache: &PatternCache, key: &str, build: impl FnOnce() -> Option<Regex>) -> Option<Regex> {
    let mut cache = cache.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(regex) = cache.get(key) {
        return regex.clone();
    }
    let regex = build();
    cache.insert(key.to_string(), regex.clone());
    regex
}

/// One-off match without a shared cache
pub fn match_key(haystack: &str, needle: &str, case_sensitive: bool, whole_words: bool) -> bool {
    KeyMatcher::new().is_match(&Haystack::new(haystack), needle, case_sensitive, whole_words)
}
