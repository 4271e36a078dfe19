//! Loreweave - lorebook activation engine
//!
//! Picks, from a pool of author-written lore entries, the subset relevant to
//! the current conversation turn and assembles it into positioned prompt
//! fragments under a token budget:
//! - Keyword / regex matching against a sliding window of chat history
//! - Sticky, cooldown and delay timers that persist across turns
//! - Inclusion groups, probability gates and recursive re-scanning
//! - Incremental token-budget accounting through an injected counter

pub mod collab;
pub mod engine;
pub mod lorebook;
pub mod scan;
pub mod settings;
pub mod timed;

pub use collab::{
    EstimatingTokenCounter, MacroSubstitutor, MacroTable, NoMacros, NoPostProcessing,
    PostProcessor, TokenCounter,
};
pub use engine::{ActivationEngine, ActivationOutput, ActivationRequest};
pub use lorebook::{activate_lorebooks, EntryKey, LoreEntry, Lorebook, LorebookSources};
pub use scan::{GlobalScanData, ScanBuffer, ScanState};
pub use settings::{InsertionStrategy, LorebookSettings};
pub use timed::{EffectKind, TimedEffect, TimedEffects, TimedEffectsManager, TimedEffectsStore};

/// Result type for Loreweave operations
pub type Result<T> = std::result::Result<T, LoreError>;

/// Errors that can occur in Loreweave
#[derive(Debug, thiserror::Error)]
pub enum LoreError {
    #[error("Token counter failed: {0}")]
    TokenCounter(String),

    #[error("Macro substitution failed: {0}")]
    Macro(String),

    #[error("Activation deadline exceeded")]
    DeadlineExceeded,

    #[error("Invalid settings: {0}")]
    Settings(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}
