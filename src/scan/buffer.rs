//! Scan buffer: the text an entry's keys are matched against

use super::matcher::{Haystack, KeyMatcher};
use crate::lorebook::{ActiveEntry, SelectiveLogic};
use crate::settings::LorebookSettings;
use serde::{Deserialize, Serialize};

/// Hard limit on how many messages can be scanned
pub const MAX_SCAN_DEPTH: usize = 1000;

/// Prefix for every haystack segment, so keys can't span two messages
const MATCHER: &str = "\x01";
const JOINER: &str = "\n\x01";

/// State of the scan loop for the pass being run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScanState {
    /// Loop finished
    None,
    /// First pass over chat history
    Initial,
    /// Re-scan including content of freshly accepted entries
    Recursion,
    /// Re-scan with a wider window to reach the minimum activation count
    MinActivations,
}

impl std::fmt::Display for ScanState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "NONE"),
            Self::Initial => write!(f, "INITIAL"),
            Self::Recursion => write!(f, "RECURSION"),
            Self::MinActivations => write!(f, "MIN_ACTIVATIONS"),
        }
    }
}

/// Auxiliary text that entries may opt into matching against
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalScanData {
    pub persona_description: String,
    pub character_description: String,
    pub character_personality: String,
    pub character_depth_prompt: String,
    pub scenario: String,
    pub creator_notes: String,
}

/// Chat history window plus recursion and inject text for one activation call
#[derive(Debug)]
pub struct ScanBuffer {
    /// Messages, most recent first
    depth_buffer: Vec<String>,
    recurse_buffer: Vec<String>,
    inject_buffer: Vec<String>,
    /// Recursion text was added since the last recursion pass started
    recurse_pending: bool,
    /// Extra depth added by min-activations passes
    skew: usize,
    scan_depth: usize,
    case_sensitive: bool,
    match_whole_words: bool,
    global: GlobalScanData,
    matcher: KeyMatcher,
}

impl ScanBuffer {
    /// Build a buffer from chat messages ordered most recent first
    pub fn new<I, S>(messages: I, global: GlobalScanData, settings: &LorebookSettings) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let depth_buffer = messages
            .into_iter()
            .take(MAX_SCAN_DEPTH)
            .map(|m| m.as_ref().trim().to_string())
            .collect();

        Self {
            depth_buffer,
            recurse_buffer: Vec::new(),
            inject_buffer: Vec::new(),
            recurse_pending: false,
            skew: 0,
            scan_depth: settings.scan_depth,
            case_sensitive: settings.case_sensitive,
            match_whole_words: settings.match_whole_words,
            global,
            matcher: KeyMatcher::new(),
        }
    }

    /// Haystack for `entry` at the given scan state
    pub fn get(&self, entry: &ActiveEntry, state: ScanState) -> String {
        let depth = entry
            .entry
            .scan_depth
            .unwrap_or_else(|| self.depth())
            .min(MAX_SCAN_DEPTH);
        if depth == 0 {
            return String::new();
        }

        let end = depth.min(self.depth_buffer.len());
        let mut result = String::from(MATCHER);
        result.push_str(&self.depth_buffer[..end].join(JOINER));

        let e = &entry.entry;
        let sources = [
            (e.match_persona_description, &self.global.persona_description),
            (e.match_character_description, &self.global.character_description),
            (e.match_character_personality, &self.global.character_personality),
            (e.match_character_depth_prompt, &self.global.character_depth_prompt),
            (e.match_scenario, &self.global.scenario),
            (e.match_creator_notes, &self.global.creator_notes),
        ];
        for (enabled, text) in sources {
            if enabled && !text.is_empty() {
                result.push_str(JOINER);
                result.push_str(text);
            }
        }

        if !self.inject_buffer.is_empty() {
            result.push_str(JOINER);
            result.push_str(&self.inject_buffer.join(JOINER));
        }

        if !self.recurse_buffer.is_empty() && state != ScanState::MinActivations {
            result.push_str(JOINER);
            result.push_str(&self.recurse_buffer.join(JOINER));
        }

        result
    }

    /// Whether `needle` matches `haystack` under `entry`'s matching rules
    pub fn match_keys(&self, haystack: &Haystack, needle: &str, entry: &ActiveEntry) -> bool {
        let case_sensitive = entry.entry.case_sensitive.unwrap_or(self.case_sensitive);
        let whole_words = entry.entry.match_whole_words.unwrap_or(self.match_whole_words);
        self.matcher
            .is_match(haystack, needle, case_sensitive, whole_words)
    }

    /// Number of matching keys, used to break ties inside inclusion groups
    pub fn score(&self, entry: &ActiveEntry, state: ScanState) -> usize {
        let e = &entry.entry;
        if e.keys.is_empty() {
            return 0;
        }
        let haystack = Haystack::new(self.get(entry, state));

        let count = |keys: &[String]| {
            keys.iter()
                .filter(|key| self.match_keys(&haystack, key.trim(), entry))
                .count()
        };
        let primary = count(&e.keys);
        if e.secondary_keys.is_empty() {
            return primary;
        }

        let secondary = count(&e.secondary_keys);
        match e.selective_logic {
            SelectiveLogic::AndAny => primary + secondary,
            SelectiveLogic::AndAll if secondary == e.secondary_keys.len() => primary + secondary,
            _ => primary,
        }
    }

    /// Current default scan depth including min-activations growth
    pub fn depth(&self) -> usize {
        self.scan_depth + self.skew
    }

    /// Widen the default scan window by one message
    pub fn advance_scan(&mut self) {
        self.skew += 1;
    }

    pub fn add_recurse(&mut self, text: impl Into<String>) {
        self.recurse_buffer.push(text.into());
        self.recurse_pending = true;
    }

    pub fn add_inject(&mut self, text: impl Into<String>) {
        self.inject_buffer.push(text.into());
    }

    /// Recursion text arrived that no recursion pass has seen yet
    pub fn has_pending_recurse(&self) -> bool {
        self.recurse_pending
    }

    /// Called when a recursion pass starts
    pub fn consume_recurse(&mut self) {
        self.recurse_pending = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lorebook::LoreEntry;

    fn buffer(messages: &[&str]) -> ScanBuffer {
        ScanBuffer::new(
            messages.iter().copied(),
            GlobalScanData {
                scenario: "A stormy harbor town".into(),
                ..Default::default()
            },
            &LorebookSettings::default(),
        )
    }

    fn active(entry: LoreEntry) -> ActiveEntry {
        ActiveEntry::new("book", &entry)
    }

    #[test]
    fn test_depth_window() {
        let buf = buffer(&["newest", "middle", "oldest"]);
        let text = buf.get(&active(LoreEntry::new(1, "x")), ScanState::Initial);
        assert!(text.contains("newest"));
        assert!(text.contains("middle"));
        assert!(!text.contains("oldest"));

        let deep = LoreEntry {
            scan_depth: Some(3),
            ..LoreEntry::new(1, "x")
        };
        assert!(buf.get(&active(deep), ScanState::Initial).contains("oldest"));

        let none = LoreEntry {
            scan_depth: Some(0),
            ..LoreEntry::new(1, "x")
        };
        assert_eq!(buf.get(&active(none), ScanState::Initial), "");
    }

    #[test]
    fn test_advance_scan_widens_window() {
        let mut buf = buffer(&["a", "b", "c"]);
        let entry = active(LoreEntry::new(1, "x"));
        assert!(!buf.get(&entry, ScanState::Initial).contains('c'));
        buf.advance_scan();
        assert_eq!(buf.depth(), 3);
        assert!(buf.get(&entry, ScanState::Initial).contains('c'));
    }

    #[test]
    fn test_global_sources_are_opt_in() {
        let buf = buffer(&["hello"]);
        let plain = active(LoreEntry::new(1, "x"));
        assert!(!buf.get(&plain, ScanState::Initial).contains("harbor"));

        let opted = active(LoreEntry {
            match_scenario: true,
            ..LoreEntry::new(2, "x")
        });
        assert!(buf.get(&opted, ScanState::Initial).contains("harbor"));
    }

    #[test]
    fn test_recursion_text_hidden_from_min_activations() {
        let mut buf = buffer(&["hello"]);
        buf.add_recurse("the lighthouse keeper");
        buf.add_inject("authors note about fog");
        let entry = active(LoreEntry::new(1, "x"));

        let recursion = buf.get(&entry, ScanState::Recursion);
        assert!(recursion.contains("lighthouse"));
        assert!(recursion.contains("fog"));

        let widening = buf.get(&entry, ScanState::MinActivations);
        assert!(!widening.contains("lighthouse"));
        assert!(widening.contains("fog"));

        assert!(buf.has_pending_recurse());
        buf.consume_recurse();
        assert!(!buf.has_pending_recurse());
    }

    #[test]
    fn test_keys_do_not_span_messages() {
        let buf = buffer(&["red", "dragon"]);
        let entry = active(LoreEntry::new(1, "x"));
        let text = Haystack::new(buf.get(&entry, ScanState::Initial));
        assert!(!buf.match_keys(&text, "red dragon", &entry));
        assert!(!buf.match_keys(&text, "dragon red", &entry));
    }

    #[test]
    fn test_score_counts_matches() {
        let buf = buffer(&["the red dragon breathes fire"]);
        let entry = active(LoreEntry {
            keys: vec!["dragon".into(), "red".into(), "blue".into()],
            secondary_keys: vec!["fire".into(), "ice".into()],
            selective_logic: SelectiveLogic::AndAll,
            ..LoreEntry::new(1, "x")
        });
        assert_eq!(buf.score(&entry, ScanState::Initial), 2);

        let any = active(LoreEntry {
            selective_logic: SelectiveLogic::AndAny,
            ..entry.entry.clone()
        });
        assert_eq!(buf.score(&any, ScanState::Initial), 3);
    }
}
