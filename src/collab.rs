//! Collaborators injected by the host
//!
//! Token counting, macro substitution and post-processing all live outside
//! the engine. The engine only awaits them and propagates their failures.

use crate::Result;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::collections::HashMap;

/// Approximate bytes per token for budget estimation
const APPROX_BYTES_PER_TOKEN: usize = 4;

static MACRO_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").expect("macro pattern is valid"));

/// Counts tokens for a piece of text.
///
/// Must be deterministic for a given text within one activation call.
#[async_trait]
pub trait TokenCounter: Send + Sync {
    async fn count_tokens(&self, text: &str) -> Result<usize>;
}

/// Expands `{{macro}}` style placeholders in entry content and keys
pub trait MacroSubstitutor: Send + Sync {
    fn substitute(&self, text: &str) -> Result<String>;
}

/// Final rewrite applied to entry content during assembly.
///
/// `depth` is set for at-depth entries only.
pub trait PostProcessor: Send + Sync {
    fn process(&self, text: &str, depth: Option<u32>) -> String;
}

/// Byte-length based token estimate, for hosts without a tokenizer
#[derive(Debug, Clone, Copy, Default)]
pub struct EstimatingTokenCounter;

#[async_trait]
impl TokenCounter for EstimatingTokenCounter {
    async fn count_tokens(&self, text: &str) -> Result<usize> {
        Ok(text.len().div_ceil(APPROX_BYTES_PER_TOKEN))
    }
}

/// Leaves text untouched
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMacros;

impl MacroSubstitutor for NoMacros {
    fn substitute(&self, text: &str) -> Result<String> {
        Ok(text.to_string())
    }
}

/// Replaces `{{name}}` with a value from a fixed table.
///
/// Names are matched case-insensitively; unknown macros are left as written.
#[derive(Debug, Clone, Default)]
pub struct MacroTable {
    values: HashMap<String, String>,
}

impl MacroTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        self.values
            .insert(name.as_ref().to_lowercase(), value.into());
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for MacroTable {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut table = Self::new();
        for (name, value) in iter {
            table.insert(name, value);
        }
        table
    }
}

impl MacroSubstitutor for MacroTable {
    fn substitute(&self, text: &str) -> Result<String> {
        if self.values.is_empty() || !text.contains("{{") {
            return Ok(text.to_string());
        }
        let replaced = MACRO_PATTERN.replace_all(text, |caps: &Captures| {
            let name = caps[1].to_lowercase();
            match self.values.get(&name) {
                Some(value) => value.clone(),
                None => caps[0].to_string(),
            }
        });
        Ok(replaced.into_owned())
    }
}

/// Returns content unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPostProcessing;

impl PostProcessor for NoPostProcessing {
    fn process(&self, text: &str, _depth: Option<u32>) -> String {
        text.to_string()
    }
}
