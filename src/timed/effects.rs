//! Persisted timed-effect state of a chat

use crate::lorebook::EntryHash;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Kinds of per-entry timers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EffectKind {
    /// Entry stays active for N turns after activating
    Sticky,
    /// Entry can't activate for N turns
    Cooldown,
    /// Entry can't activate before the chat reaches N messages
    Delay,
}

impl std::fmt::Display for EffectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sticky => write!(f, "sticky"),
            Self::Cooldown => write!(f, "cooldown"),
            Self::Delay => write!(f, "delay"),
        }
    }
}

/// One running timer, measured in chat turns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimedEffect {
    /// Content hash of the entry when the effect started
    pub hash: EntryHash,
    pub start: usize,
    pub end: usize,
    /// Survives a call where the chat hasn't advanced past `start`
    #[serde(default)]
    pub protected: bool,
}

/// Sticky and cooldown timers of one chat, keyed by `"lorebook.uid"`.
///
/// Delay is derived from chat length on every call and never stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimedEffects {
    pub sticky: BTreeMap<String, TimedEffect>,
    pub cooldown: BTreeMap<String, TimedEffect>,
}

impl TimedEffects {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored effects of `kind`; `None` for delay
    pub fn of_kind(&self, kind: EffectKind) -> Option<&BTreeMap<String, TimedEffect>> {
        match kind {
            EffectKind::Sticky => Some(&self.sticky),
            EffectKind::Cooldown => Some(&self.cooldown),
            EffectKind::Delay => None,
        }
    }

    pub fn of_kind_mut(&mut self, kind: EffectKind) -> Option<&mut BTreeMap<String, TimedEffect>> {
        match kind {
            EffectKind::Sticky => Some(&mut self.sticky),
            EffectKind::Cooldown => Some(&mut self.cooldown),
            EffectKind::Delay => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sticky.is_empty() && self.cooldown.is_empty()
    }
}
