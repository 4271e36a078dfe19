//! Lorebook scan settings

use crate::{LoreError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;

/// How character-bound and global lorebooks are ordered against each other
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InsertionStrategy {
    /// Character and global entries compete purely on `order`
    #[default]
    Evenly,
    /// Character-bound entries precede global ones regardless of `order`
    CharacterFirst,
    /// Global entries precede character-bound ones regardless of `order`
    GlobalFirst,
}

impl std::fmt::Display for InsertionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Evenly => write!(f, "evenly"),
            Self::CharacterFirst => write!(f, "character_first"),
            Self::GlobalFirst => write!(f, "global_first"),
        }
    }
}

/// Settings that drive one activation call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LorebookSettings {
    /// Percentage of the model's max context reserved for lore
    pub context_percent: u32,

    /// Hard cap on the budget in tokens (0 = no cap)
    pub budget_cap: usize,

    /// How many recent messages are scanned by default
    pub scan_depth: usize,

    /// Depth the min-activations search may grow to (0 = chat length)
    pub max_depth: usize,

    /// Keep widening the scan until this many entries are accepted
    pub min_activations: usize,

    /// Hard stop on the number of passes (0 = unlimited)
    pub max_recursion_steps: usize,

    /// Re-scan using the content of freshly accepted entries
    pub recursive_scan: bool,

    pub insertion_strategy: InsertionStrategy,

    pub match_whole_words: bool,

    pub case_sensitive: bool,

    pub use_group_scoring: bool,

    /// Log a warning when the budget overflows
    pub alert_on_overflow: bool,
}

impl Default for LorebookSettings {
    fn default() -> Self {
        Self {
            context_percent: 25,
            budget_cap: 0,
            scan_depth: 2,
            max_depth: 0,
            min_activations: 0,
            max_recursion_steps: 0,
            recursive_scan: true,
            insertion_strategy: InsertionStrategy::Evenly,
            match_whole_words: false,
            case_sensitive: false,
            use_group_scoring: false,
            alert_on_overflow: false,
        }
    }
}

impl LorebookSettings {
    /// Parse settings from TOML text. Missing keys keep their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let settings: Self = toml::from_str(text)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a TOML file
    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).await?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.context_percent == 0 || self.context_percent > 100 {
            return Err(LoreError::Settings(format!(
                "context_percent must be within 1..=100, got {}",
                self.context_percent
            )));
        }
        Ok(())
    }

    /// Token budget for a model with `max_context` tokens.
    ///
    /// `None` when the max context is unknown, which means no activation
    /// should be attempted at all.
    pub fn budget(&self, max_context: usize) -> Option<usize> {
        if max_context == 0 {
            return None;
        }
        let raw = (self.context_percent as f64 * max_context as f64 / 100.0).round() as usize;
        let mut budget = raw.max(1);
        if self.budget_cap > 0 && budget > self.budget_cap {
            budget = self.budget_cap;
        }
        Some(budget)
    }

    pub fn with_context_percent(mut self, percent: u32) -> Self {
        self.context_percent = percent;
        self
    }

    pub fn with_budget_cap(mut self, cap: usize) -> Self {
        self.budget_cap = cap;
        self
    }

    pub fn with_scan_depth(mut self, depth: usize) -> Self {
        self.scan_depth = depth;
        self
    }

    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn with_min_activations(mut self, count: usize) -> Self {
        self.min_activations = count;
        self
    }

    pub fn with_max_recursion_steps(mut self, steps: usize) -> Self {
        self.max_recursion_steps = steps;
        self
    }

    pub fn with_recursive_scan(mut self, enabled: bool) -> Self {
        self.recursive_scan = enabled;
        self
    }

    pub fn with_insertion_strategy(mut self, strategy: InsertionStrategy) -> Self {
        self.insertion_strategy = strategy;
        self
    }

    pub fn with_match_whole_words(mut self, enabled: bool) -> Self {
        self.match_whole_words = enabled;
        self
    }

    pub fn with_case_sensitive(mut self, enabled: bool) -> Self {
        self.case_sensitive = enabled;
        self
    }

    pub fn with_group_scoring(mut self, enabled: bool) -> Self {
        self.use_group_scoring = enabled;
        self
    }

    pub fn with_alert_on_overflow(mut self, enabled: bool) -> Self {
        self.alert_on_overflow = enabled;
        self
    }
}
