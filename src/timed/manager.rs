//! Per-call view over a chat's timed effects
//!
//! At the start of a call the stored effects are pruned and the set of
//! entries currently sticky, cooling down or delayed is computed. At the
//! end of a call new effects are recorded for every accepted entry.

use super::effects::{EffectKind, TimedEffect, TimedEffects};
use crate::lorebook::{ActiveEntry, EntryKey};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Where an entry is in one of its timers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectMetadata {
    pub start: usize,
    pub end: usize,
    /// Turns left before the effect ends
    pub remaining: usize,
}

/// Timed effects of one chat during one activation call.
///
/// Borrows the chat's stored effects. Sticky and cooldown timers are pruned
/// and chained on [`check_timed_effects`](Self::check_timed_effects), delay
/// is derived from the chat length, and new timers are recorded for
/// accepted entries by [`set_timed_effects`](Self::set_timed_effects).
pub struct TimedEffectsManager<'a> {
    effects: &'a mut TimedEffects,
    chat_length: usize,
    sticky: HashSet<EntryKey>,
    cooldown: HashSet<EntryKey>,
    delay: HashSet<EntryKey>,
}

impl<'a> TimedEffectsManager<'a> {
    pub fn new(effects: &'a mut TimedEffects, chat_length: usize) -> Self {
        Self {
            effects,
            chat_length,
            sticky: HashSet::new(),
            cooldown: HashSet::new(),
            delay: HashSet::new(),
        }
    }

    pub fn chat_length(&self) -> usize {
        self.chat_length
    }

    /// Prune stored effects and compute which entries are under an effect
    /// for this call.
    pub fn check_timed_effects(&mut self, entries: &[ActiveEntry]) {
        let by_key: HashMap<String, &ActiveEntry> =
            entries.iter().map(|e| (e.key.to_string(), e)).collect();

        // Sticky first: an ending sticky may start a cooldown
        self.check_kind(EffectKind::Sticky, &by_key);
        self.check_kind(EffectKind::Cooldown, &by_key);

        self.delay = entries
            .iter()
            .filter(|e| e.entry.delay > 0 && self.chat_length < e.entry.delay as usize)
            .map(|e| e.key.clone())
            .collect();

        debug!(
            "Timed effects at turn {}: {} sticky, {} cooldown, {} delayed",
            self.chat_length,
            self.sticky.len(),
            self.cooldown.len(),
            self.delay.len()
        );
    }

    fn check_kind(&mut self, kind: EffectKind, by_key: &HashMap<String, &ActiveEntry>) {
        let chat_length = self.chat_length;
        let Some(stored) = self.effects.of_kind(kind) else {
            return;
        };

        let mut expired = Vec::new();
        let mut ended = Vec::new();
        let mut active = Vec::new();

        for (key, effect) in stored {
            // Never got past the turn it was set on (regenerated or rewound)
            if chat_length <= effect.start && !effect.protected {
                expired.push(key.clone());
                continue;
            }

            let Some(entry) = by_key.get(key) else {
                // May belong to a lorebook that isn't bound right now
                if chat_length >= effect.end {
                    expired.push(key.clone());
                }
                continue;
            };

            if entry.entry.timed_duration(kind) == 0 {
                expired.push(key.clone());
                continue;
            }

            if chat_length >= effect.end {
                expired.push(key.clone());
                ended.push(*entry);
                continue;
            }

            active.push(entry.key.clone());
        }

        if let Some(stored) = self.effects.of_kind_mut(kind) {
            for key in &expired {
                stored.remove(key);
            }
        }
        if !expired.is_empty() {
            debug!("Removed {} {} effects: {:?}", expired.len(), kind, expired);
        }

        self.active_set_mut(kind).extend(active);
        for entry in ended {
            self.on_ended(kind, entry);
        }
    }

    fn on_ended(&mut self, kind: EffectKind, entry: &ActiveEntry) {
        if kind != EffectKind::Sticky || entry.entry.cooldown == 0 {
            debug!("{} ended for {}", kind, entry.key);
            return;
        }

        // Cooldown starts the moment sticky ends, and must survive this turn
        let effect = self.new_effect(EffectKind::Cooldown, entry, true);
        self.effects
            .cooldown
            .insert(entry.key.to_string(), effect);
        self.cooldown.insert(entry.key.clone());
        debug!(
            "Sticky ended for {}, cooldown until turn {}",
            entry.key, effect.end
        );
    }

    fn new_effect(&self, kind: EffectKind, entry: &ActiveEntry, protected: bool) -> TimedEffect {
        TimedEffect {
            hash: entry.hash,
            start: self.chat_length,
            end: self.chat_length + entry.entry.timed_duration(kind) as usize,
            protected,
        }
    }

    fn active_set(&self, kind: EffectKind) -> &HashSet<EntryKey> {
        match kind {
            EffectKind::Sticky => &self.sticky,
            EffectKind::Cooldown => &self.cooldown,
            EffectKind::Delay => &self.delay,
        }
    }

    fn active_set_mut(&mut self, kind: EffectKind) -> &mut HashSet<EntryKey> {
        match kind {
            EffectKind::Sticky => &mut self.sticky,
            EffectKind::Cooldown => &mut self.cooldown,
            EffectKind::Delay => &mut self.delay,
        }
    }

    pub fn is_effect_active(&self, kind: EffectKind, entry: &ActiveEntry) -> bool {
        self.active_set(kind).contains(&entry.key)
    }

    /// Record sticky and cooldown effects for entries accepted this call.
    ///
    /// An entry that still has a stored effect of a kind keeps it unchanged.
    pub fn set_timed_effects<'e, I>(&mut self, activated: I)
    where
        I: IntoIterator<Item = &'e ActiveEntry>,
    {
        for entry in activated {
            for kind in [EffectKind::Sticky, EffectKind::Cooldown] {
                if entry.entry.timed_duration(kind) == 0 {
                    continue;
                }
                let key = entry.key.to_string();
                let effect = self.new_effect(kind, entry, false);
                if let Some(stored) = self.effects.of_kind_mut(kind) {
                    if !stored.contains_key(&key) {
                        debug!("Set {} for {} until turn {}", kind, key, effect.end);
                        stored.insert(key, effect);
                    }
                }
            }
        }
    }

    /// Start (`enabled`) or clear an effect by hand.
    ///
    /// Only sticky and cooldown can be set; returns whether anything changed.
    pub fn set_timed_effect(&mut self, kind: EffectKind, entry: &ActiveEntry, enabled: bool) -> bool {
        if kind == EffectKind::Delay {
            return false;
        }
        let key = entry.key.to_string();
        let effect = self.new_effect(kind, entry, false);
        let Some(stored) = self.effects.of_kind_mut(kind) else {
            return false;
        };

        if enabled {
            stored.insert(key, effect);
            self.active_set_mut(kind).insert(entry.key.clone());
            true
        } else {
            let removed = stored.remove(&key).is_some();
            self.active_set_mut(kind).remove(&entry.key);
            removed
        }
    }

    /// Timer position of `entry`, if the effect applies to it right now
    pub fn effect_metadata(&self, kind: EffectKind, entry: &ActiveEntry) -> Option<EffectMetadata> {
        if !self.is_effect_active(kind, entry) {
            return None;
        }

        let (start, end) = match self.effects.of_kind(kind) {
            Some(stored) => {
                let effect = stored.get(&entry.key.to_string())?;
                (effect.start, effect.end)
            }
            None => (0, entry.entry.delay as usize),
        };

        Some(EffectMetadata {
            start,
            end,
            remaining: end.saturating_sub(self.chat_length),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lorebook::LoreEntry;

    fn entry(uid: i64, sticky: u32, cooldown: u32, delay: u32) -> ActiveEntry {
        ActiveEntry::new(
            "book",
            &LoreEntry {
                sticky,
                cooldown,
                delay,
                ..LoreEntry::new(uid, "content")
            },
        )
    }

    #[test]
    fn test_delay_is_derived_from_chat_length() {
        let e = entry(1, 0, 0, 5);
        let mut effects = TimedEffects::new();

        let mut early = TimedEffectsManager::new(&mut effects, 3);
        early.check_timed_effects(std::slice::from_ref(&e));
        assert!(early.is_effect_active(EffectKind::Delay, &e));
        assert_eq!(
            early.effect_metadata(EffectKind::Delay, &e).map(|m| m.remaining),
            Some(2)
        );

        let mut late = TimedEffectsManager::new(&mut effects, 6);
        late.check_timed_effects(std::slice::from_ref(&e));
        assert!(!late.is_effect_active(EffectKind::Delay, &e));
        assert!(effects.is_empty());
    }

    #[test]
    fn test_sticky_lifecycle_chains_into_cooldown() {
        let e = entry(1, 2, 3, 0);
        let mut effects = TimedEffects::new();

        // Activated at turn 10
        let mut mgr = TimedEffectsManager::new(&mut effects, 10);
        mgr.check_timed_effects(std::slice::from_ref(&e));
        mgr.set_timed_effects([&e]);
        assert_eq!(effects.sticky["book.1"].end, 12);

        // Turn 11: still sticky
        let mut mgr = TimedEffectsManager::new(&mut effects, 11);
        mgr.check_timed_effects(std::slice::from_ref(&e));
        assert!(mgr.is_effect_active(EffectKind::Sticky, &e));

        // Turn 12: sticky ends, a protected cooldown starts now
        let mut mgr = TimedEffectsManager::new(&mut effects, 12);
        mgr.check_timed_effects(std::slice::from_ref(&e));
        assert!(!mgr.is_effect_active(EffectKind::Sticky, &e));
        assert!(mgr.is_effect_active(EffectKind::Cooldown, &e));
        let cooldown = effects.cooldown["book.1"];
        assert!(cooldown.protected);
        assert_eq!((cooldown.start, cooldown.end), (12, 15));
        assert!(effects.sticky.is_empty());

        // Same turn again: protected cooldown is kept
        let mut mgr = TimedEffectsManager::new(&mut effects, 12);
        mgr.check_timed_effects(std::slice::from_ref(&e));
        assert!(mgr.is_effect_active(EffectKind::Cooldown, &e));
    }

    #[test]
    fn test_unadvanced_effect_is_dropped() {
        let e = entry(1, 3, 0, 0);
        let mut effects = TimedEffects::new();
        let mut mgr = TimedEffectsManager::new(&mut effects, 4);
        mgr.set_timed_effects([&e]);

        // Regenerating at the same turn discards the effect
        let mut mgr = TimedEffectsManager::new(&mut effects, 4);
        mgr.check_timed_effects(std::slice::from_ref(&e));
        assert!(!mgr.is_effect_active(EffectKind::Sticky, &e));
        assert!(effects.sticky.is_empty());
    }

    #[test]
    fn test_orphaned_and_unconfigured_effects() {
        let mut effects = TimedEffects::new();
        let effect = TimedEffect {
            hash: crate::lorebook::EntryHash(1),
            start: 1,
            end: 5,
            protected: false,
        };
        effects.sticky.insert("elsewhere.9".into(), effect);
        effects.sticky.insert("book.1".into(), effect);

        // book.1 no longer declares sticky
        let e = entry(1, 0, 0, 0);
        let mut mgr = TimedEffectsManager::new(&mut effects, 3);
        mgr.check_timed_effects(std::slice::from_ref(&e));
        assert!(!mgr.is_effect_active(EffectKind::Sticky, &e));
        assert!(effects.sticky.contains_key("elsewhere.9"));
        assert!(!effects.sticky.contains_key("book.1"));

        // The unknown entry is dropped once its end has passed
        let mut mgr = TimedEffectsManager::new(&mut effects, 5);
        mgr.check_timed_effects(&[]);
        assert!(effects.sticky.is_empty());
    }

    #[test]
    fn test_existing_effect_not_extended() {
        let e = entry(1, 0, 4, 0);
        let mut effects = TimedEffects::new();
        TimedEffectsManager::new(&mut effects, 2).set_timed_effects([&e]);
        TimedEffectsManager::new(&mut effects, 3).set_timed_effects([&e]);
        assert_eq!(effects.cooldown["book.1"].end, 6);
    }

    #[test]
    fn test_manual_effects() {
        let e = entry(1, 2, 0, 0);
        let mut effects = TimedEffects::new();
        let mut mgr = TimedEffectsManager::new(&mut effects, 7);
        assert!(mgr.set_timed_effect(EffectKind::Sticky, &e, true));
        assert!(mgr.is_effect_active(EffectKind::Sticky, &e));
        assert_eq!(
            mgr.effect_metadata(EffectKind::Sticky, &e),
            Some(EffectMetadata {
                start: 7,
                end: 9,
                remaining: 2
            })
        );
        assert!(!mgr.set_timed_effect(EffectKind::Delay, &e, true));
        assert!(mgr.set_timed_effect(EffectKind::Sticky, &e, false));
        assert!(!mgr.is_effect_active(EffectKind::Sticky, &e));
    }
}
