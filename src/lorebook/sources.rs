//! Lorebook source merging
//!
//! Lorebooks reach a scan through several bindings (chat, persona, group,
//! character, global selection). Each book is assigned to the first binding
//! that claims it, books are ordered by binding precedence, and their entries
//! are flattened into one priority-ordered list of working copies.

use super::entry::{ActiveEntry, Lorebook};
use crate::settings::InsertionStrategy;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Names of the lorebooks bound to each scope of the current scan
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LorebookSources {
    /// Books selected globally by the user
    pub global: Vec<String>,
    /// Book bound to the current chat
    pub chat: Option<String>,
    /// Book bound to the current persona
    pub persona: Option<String>,
    /// Books bound to the current group chat
    pub group: Vec<String>,
    /// The character's primary book
    pub character_primary: Option<String>,
    /// Additional books bound to the character
    pub character: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Global,
    Chat,
    Persona,
    Group,
    CharacterPrimary,
    Character,
}

impl LorebookSources {
    /// First scope claiming `name`, in precedence order
    fn scope_of(&self, name: &str) -> Option<Scope> {
        let is = |candidate: &Option<String>| candidate.as_deref() == Some(name);
        let listed = |list: &[String]| list.iter().any(|n| n == name);

        if listed(&self.global) {
            Some(Scope::Global)
        } else if is(&self.chat) {
            Some(Scope::Chat)
        } else if is(&self.persona) {
            Some(Scope::Persona)
        } else if listed(&self.group) {
            Some(Scope::Group)
        } else if is(&self.character_primary) {
            Some(Scope::CharacterPrimary)
        } else if listed(&self.character) {
            Some(Scope::Character)
        } else {
            None
        }
    }
}

#[derive(Default)]
struct Buckets<'a> {
    global: Vec<&'a Lorebook>,
    chat: Vec<&'a Lorebook>,
    persona: Vec<&'a Lorebook>,
    group: Vec<&'a Lorebook>,
    primary: Vec<&'a Lorebook>,
    character: Vec<&'a Lorebook>,
}

fn flatten(books: &[&Lorebook]) -> Vec<ActiveEntry> {
    books
        .iter()
        .flat_map(|book| {
            book.entries
                .iter()
                .map(|entry| ActiveEntry::new(&book.name, entry))
        })
        .collect()
}

/// Stable sort by descending `order`
fn sort_by_priority(entries: &mut [ActiveEntry]) {
    entries.sort_by(|a, b| b.entry.order.cmp(&a.entry.order));
}

/// Collect the entries of every bound lorebook in priority order.
///
/// The result is a deep copy: the engine rewrites entry content during a
/// call, so nothing may alias the caller's lorebooks.
pub fn activate_lorebooks(
    lorebooks: &[Lorebook],
    sources: &LorebookSources,
    strategy: InsertionStrategy,
) -> Vec<ActiveEntry> {
    let mut buckets = Buckets::default();
    for book in lorebooks {
        match sources.scope_of(&book.name) {
            Some(Scope::Global) => buckets.global.push(book),
            Some(Scope::Chat) => buckets.chat.push(book),
            Some(Scope::Persona) => buckets.persona.push(book),
            Some(Scope::Group) => buckets.group.push(book),
            Some(Scope::CharacterPrimary) => buckets.primary.push(book),
            Some(Scope::Character) => buckets.character.push(book),
            None => debug!("Lorebook '{}' is not bound to this scan", book.name),
        }
    }

    let character_books: Vec<&Lorebook> = buckets
        .group
        .iter()
        .chain(&buckets.primary)
        .chain(&buckets.character)
        .copied()
        .collect();

    let mut chat = flatten(&buckets.chat);
    let mut persona = flatten(&buckets.persona);
    let mut character = flatten(&character_books);
    let mut global = flatten(&buckets.global);

    let entries = match strategy {
        InsertionStrategy::Evenly => {
            let mut all = chat;
            all.append(&mut persona);
            all.append(&mut character);
            all.append(&mut global);
            sort_by_priority(&mut all);
            all
        }
        InsertionStrategy::CharacterFirst | InsertionStrategy::GlobalFirst => {
            for segment in [&mut chat, &mut persona, &mut character, &mut global] {
                sort_by_priority(segment);
            }
            let (first, second) = if strategy == InsertionStrategy::CharacterFirst {
                (character, global)
            } else {
                (global, character)
            };
            chat.into_iter()
                .chain(persona)
                .chain(first)
                .chain(second)
                .collect()
        }
    };

    debug!(
        "Merged {} entries from {} lorebooks ({})",
        entries.len(),
        lorebooks.len(),
        strategy
    );
    entries
}
