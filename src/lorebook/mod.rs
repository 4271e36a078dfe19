//! Lorebooks, their entries, and the merge of bound lorebooks into one
//! priority-ordered entry list.

mod entry;
mod sources;

pub use entry::{
    parse_decorators, ActiveEntry, Character, CharacterFilter, Decorator, EntryHash, EntryKey,
    GenerationTrigger, LoreEntry, Lorebook, Position, RecursionDelay, Role, SelectiveLogic,
    DEFAULT_DEPTH, DEFAULT_WEIGHT,
};
pub use sources::{activate_lorebooks, LorebookSources};
