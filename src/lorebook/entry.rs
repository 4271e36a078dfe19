//! Lore entry model
//!
//! `LoreEntry` is the author-facing record as stored in a lorebook.
//! `ActiveEntry` is the per-call working copy the engine mutates.

use crate::timed::EffectKind;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Depth used for at-depth entries that don't declare one
pub const DEFAULT_DEPTH: u32 = 4;

/// Inclusion group weight used when an entry doesn't declare one
pub const DEFAULT_WEIGHT: u32 = 100;

/// Where accepted content is placed in the prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Position {
    #[default]
    Before,
    After,
    AnTop,
    AnBottom,
    AtDepth,
    EmTop,
    EmBottom,
}

/// Combinator applied to secondary key matches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SelectiveLogic {
    #[default]
    AndAny,
    NotAll,
    NotAny,
    AndAll,
}

/// Message role for at-depth insertions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    System,
    User,
    Assistant,
}

/// Kind of generation that triggered the scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GenerationTrigger {
    #[default]
    Normal,
    Continue,
    Impersonate,
    Swipe,
    Regenerate,
    Quiet,
}

/// `delayUntilRecursion` accepts either a flag or an explicit level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecursionDelay {
    Flag(bool),
    Level(u32),
}

impl Default for RecursionDelay {
    fn default() -> Self {
        Self::Flag(false)
    }
}

impl RecursionDelay {
    /// Recursion level the entry waits for, `None` when not delayed
    pub fn level(&self) -> Option<u32> {
        match *self {
            Self::Flag(true) => Some(1),
            Self::Flag(false) | Self::Level(0) => None,
            Self::Level(level) => Some(level),
        }
    }
}

/// The character a scan runs for
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Character {
    pub name: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Limits an entry to (or away from) specific characters
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CharacterFilter {
    pub is_exclude: bool,
    pub names: Vec<String>,
    pub tags: Vec<String>,
}

impl CharacterFilter {
    /// Whether this filter keeps the entry away from `character`
    pub fn rejects(&self, character: Option<&Character>) -> bool {
        if !self.names.is_empty() {
            let included = character.is_some_and(|c| self.names.contains(&c.name));
            if included == self.is_exclude {
                return true;
            }
        }

        // Tags are only known once a character is loaded
        if !self.tags.is_empty() {
            if let Some(character) = character {
                let has_tag = character.tags.iter().any(|t| self.tags.contains(t));
                if has_tag == self.is_exclude {
                    return true;
                }
            }
        }

        false
    }
}

/// One lore entry as authored
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoreEntry {
    pub uid: i64,
    #[serde(alias = "key")]
    pub keys: Vec<String>,
    #[serde(alias = "keysecondary")]
    pub secondary_keys: Vec<String>,
    pub comment: String,
    pub content: String,
    pub constant: bool,
    pub selective: bool,
    pub selective_logic: SelectiveLogic,
    pub position: Position,
    pub depth: Option<u32>,
    pub role: Option<Role>,
    /// Priority, higher is processed first
    pub order: i32,
    pub probability: u32,
    pub use_probability: bool,
    pub sticky: u32,
    pub cooldown: u32,
    pub delay: u32,
    pub delay_until_recursion: RecursionDelay,
    pub exclude_recursion: bool,
    pub prevent_recursion: bool,
    /// Comma-separated inclusion group names
    pub group: String,
    pub group_override: bool,
    pub group_weight: Option<u32>,
    pub use_group_scoring: Option<bool>,
    pub scan_depth: Option<usize>,
    pub case_sensitive: Option<bool>,
    pub match_whole_words: Option<bool>,
    pub character_filter: CharacterFilter,
    pub match_persona_description: bool,
    pub match_character_description: bool,
    pub match_character_personality: bool,
    pub match_character_depth_prompt: bool,
    pub match_scenario: bool,
    pub match_creator_notes: bool,
    pub triggers: Vec<GenerationTrigger>,
    #[serde(alias = "disable")]
    pub disabled: bool,
}

impl Default for LoreEntry {
    fn default() -> Self {
        Self {
            uid: 0,
            keys: Vec::new(),
            secondary_keys: Vec::new(),
            comment: String::new(),
            content: String::new(),
            constant: false,
            selective: true,
            selective_logic: SelectiveLogic::AndAny,
            position: Position::Before,
            depth: None,
            role: None,
            order: 100,
            probability: 100,
            use_probability: true,
            sticky: 0,
            cooldown: 0,
            delay: 0,
            delay_until_recursion: RecursionDelay::default(),
            exclude_recursion: false,
            prevent_recursion: false,
            group: String::new(),
            group_override: false,
            group_weight: None,
            use_group_scoring: None,
            scan_depth: None,
            case_sensitive: None,
            match_whole_words: None,
            character_filter: CharacterFilter::default(),
            match_persona_description: false,
            match_character_description: false,
            match_character_personality: false,
            match_character_depth_prompt: false,
            match_scenario: false,
            match_creator_notes: false,
            triggers: Vec::new(),
            disabled: false,
        }
    }
}

impl LoreEntry {
    pub fn new(uid: i64, content: impl Into<String>) -> Self {
        Self {
            uid,
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn with_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    /// Duration in turns declared for a timed effect
    pub fn timed_duration(&self, kind: EffectKind) -> u32 {
        match kind {
            EffectKind::Sticky => self.sticky,
            EffectKind::Cooldown => self.cooldown,
            EffectKind::Delay => self.delay,
        }
    }

    pub fn group_weight(&self) -> u32 {
        self.group_weight.unwrap_or(DEFAULT_WEIGHT)
    }
}

/// A named collection of lore entries
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lorebook {
    pub name: String,
    #[serde(default)]
    pub entries: Vec<LoreEntry>,
}

impl Lorebook {
    pub fn new(name: impl Into<String>, entries: Vec<LoreEntry>) -> Self {
        Self {
            name: name.into(),
            entries,
        }
    }
}

/// Addressable identity of an entry: uid qualified by its lorebook
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryKey {
    pub lorebook: String,
    pub uid: i64,
}

impl EntryKey {
    pub fn new(lorebook: impl Into<String>, uid: i64) -> Self {
        Self {
            lorebook: lorebook.into(),
            uid,
        }
    }
}

impl std::fmt::Display for EntryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.lorebook, self.uid)
    }
}

/// Content hash of an entry, stable within one activation call only
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryHash(pub u64);

impl EntryHash {
    pub fn of(lorebook: &str, entry: &LoreEntry) -> Self {
        let mut hasher = DefaultHasher::new();
        lorebook.hash(&mut hasher);
        entry.hash(&mut hasher);
        Self(hasher.finish())
    }
}

impl std::fmt::Display for EntryHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Content directives written as leading `@@` lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decorator {
    /// Activate whenever the entry is eligible
    Activate,
    /// Never activate by keys or `constant`
    DontActivate,
}

impl Decorator {
    fn parse(line: &str) -> Option<Self> {
        // `@@@name` is an escaped `@@name`
        let line = match line.strip_prefix('@') {
            Some(rest) if rest.starts_with("@@") => rest,
            _ => line,
        };
        if line.starts_with("@@activate") {
            Some(Self::Activate)
        } else if line.starts_with("@@dont_activate") {
            Some(Self::DontActivate)
        } else {
            None
        }
    }
}

/// Split leading decorator lines off `content`.
///
/// Returns the recognized decorators and the remaining content. Unknown
/// decorator lines are dropped.
pub fn parse_decorators(content: &str) -> (Vec<Decorator>, String) {
    if !content.starts_with("@@") {
        return (Vec::new(), content.to_string());
    }

    let lines: Vec<&str> = content.split('\n').collect();
    let mut decorators = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        if !line.starts_with("@@") {
            return (decorators, lines[i..].join("\n"));
        }
        if let Some(decorator) = Decorator::parse(line) {
            if !decorators.contains(&decorator) {
                decorators.push(decorator);
            }
        }
    }
    (decorators, String::new())
}

/// Working copy of an entry owned by one activation call
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveEntry {
    pub key: EntryKey,
    pub hash: EntryHash,
    /// Entry as merged from its lorebook, decorators already stripped
    pub entry: LoreEntry,
    pub decorators: Vec<Decorator>,
    /// Content after macro substitution, set once the entry is processed
    pub substituted: Option<String>,
}

impl ActiveEntry {
    pub fn new(lorebook: &str, entry: &LoreEntry) -> Self {
        let (decorators, content) = parse_decorators(&entry.content);
        let entry = LoreEntry {
            content,
            ..entry.clone()
        };
        Self {
            key: EntryKey::new(lorebook, entry.uid),
            hash: EntryHash::of(lorebook, &entry),
            entry,
            decorators,
            substituted: None,
        }
    }

    pub fn has_decorator(&self, decorator: Decorator) -> bool {
        self.decorators.contains(&decorator)
    }

    /// Inclusion groups this entry belongs to
    pub fn groups(&self) -> impl Iterator<Item = &str> {
        self.entry
            .group
            .split(',')
            .map(str::trim)
            .filter(|g| !g.is_empty())
    }

    pub fn in_group(&self, group: &str) -> bool {
        self.groups().any(|g| g == group)
    }

    /// Substituted content when available, the authored content otherwise
    pub fn content(&self) -> &str {
        self.substituted.as_deref().unwrap_or(&self.entry.content)
    }
}
