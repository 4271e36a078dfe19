//! Inclusion group resolution
//!
//! Entries sharing a group compete: per call at most one of them (or the
//! sticky subset) survives.

use crate::lorebook::ActiveEntry;
use crate::scan::{ScanBuffer, ScanState};
use crate::settings::LorebookSettings;
use crate::timed::{EffectKind, TimedEffectsManager};
use rand::Rng;
use std::collections::HashSet;
use tracing::debug;

/// Everything group resolution reads besides the candidates
pub(crate) struct GroupScope<'a, 'm> {
    pub entries: &'a [ActiveEntry],
    /// Entries accepted in earlier passes of this call
    pub accepted: &'a [usize],
    pub buffer: &'a ScanBuffer,
    pub timed: &'a TimedEffectsManager<'m>,
    pub settings: &'a LorebookSettings,
    pub state: ScanState,
}

/// Candidates of this pass grouped by group name, in first-seen order
fn group_candidates(candidates: &[usize], entries: &[ActiveEntry]) -> Vec<(String, Vec<usize>)> {
    let mut groups: Vec<(String, Vec<usize>)> = Vec::new();
    for &i in candidates {
        for name in entries[i].groups() {
            match groups.iter_mut().find(|(g, _)| g == name) {
                Some((_, members)) => members.push(i),
                None => groups.push((name.to_string(), vec![i])),
            }
        }
    }
    groups
}

/// Drop this pass's candidates that lose their inclusion groups
pub(crate) fn resolve_inclusion_groups<R: Rng + ?Sized>(
    candidates: &mut Vec<usize>,
    scope: &GroupScope<'_, '_>,
    rng: &mut R,
) {
    let groups = group_candidates(candidates, scope.entries);
    if groups.is_empty() {
        return;
    }

    let entries = scope.entries;
    let is_sticky = |i: usize| scope.timed.is_effect_active(EffectKind::Sticky, &entries[i]);
    let mut removed: HashSet<usize> = HashSet::new();

    for (name, mut group) in groups {
        if scope
            .accepted
            .iter()
            .any(|&i| entries[i].in_group(&name))
        {
            debug!("Group '{}' was filled by an earlier pass, dropping {} entries", name, group.len());
            removed.extend(group);
            continue;
        }

        if group.len() <= 1 {
            continue;
        }

        if group.iter().any(|&i| is_sticky(i)) {
            for &i in group.iter().filter(|&&i| !is_sticky(i)) {
                debug!("Group '{}': {} loses to a sticky entry", name, entries[i].key);
                removed.insert(i);
            }
            continue;
        }

        group.retain(|&i| {
            let blocked = scope.timed.is_effect_active(EffectKind::Cooldown, &entries[i])
                || scope.timed.is_effect_active(EffectKind::Delay, &entries[i]);
            if blocked {
                removed.insert(i);
            }
            !blocked
        });

        let scoring = scope.settings.use_group_scoring
            || group
                .iter()
                .any(|&i| entries[i].entry.use_group_scoring == Some(true));
        if scoring {
            filter_by_score(&name, &mut group, scope, &mut removed);
        }

        if group.is_empty() {
            continue;
        }

        if let Some(&winner) = group.iter().find(|&&i| entries[i].entry.group_override) {
            debug!("Group '{}': {} wins by override", name, entries[winner].key);
            removed.extend(group.into_iter().filter(|&i| i != winner));
            continue;
        }

        let weights: Vec<u32> = group.iter().map(|&i| entries[i].entry.group_weight()).collect();
        let Some(pick) = weighted_pick(&weights, rng) else {
            debug!("Group '{}': no winner drawn", name);
            continue;
        };
        let winner = group[pick];
        debug!("Group '{}': {} wins the weighted draw", name, entries[winner].key);
        removed.extend(group.into_iter().filter(|&i| i != winner));
    }

    candidates.retain(|i| !removed.contains(i));
}

/// Drop scored members below the group's best key-match score
fn filter_by_score(
    name: &str,
    group: &mut Vec<usize>,
    scope: &GroupScope<'_, '_>,
    removed: &mut HashSet<usize>,
) {
    let scores: Vec<usize> = group
        .iter()
        .map(|&i| scope.buffer.score(&scope.entries[i], scope.state))
        .collect();
    let Some(&max) = scores.iter().max() else {
        return;
    };

    let mut kept = Vec::with_capacity(group.len());
    for (&i, &score) in group.iter().zip(&scores) {
        let scored = scope.entries[i]
            .entry
            .use_group_scoring
            .unwrap_or(scope.settings.use_group_scoring);
        if scored && score < max {
            debug!("Group '{}': {} scored {} < {}", name, scope.entries[i].key, score, max);
            removed.insert(i);
        } else {
            kept.push(i);
        }
    }
    *group = kept;
}

/// Roulette draw over cumulative weights, returning the winning index
pub(crate) fn weighted_pick<R: Rng + ?Sized>(weights: &[u32], rng: &mut R) -> Option<usize> {
    if weights.is_empty() {
        return None;
    }
    let total: f64 = weights.iter().map(|&w| w as f64).sum();
    let roll = rng.gen::<f64>() * total;

    let mut cumulative = 0.0;
    for (i, &weight) in weights.iter().enumerate() {
        cumulative += weight as f64;
        if roll <= cumulative {
            return Some(i);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lorebook::{EntryHash, LoreEntry};
    use crate::scan::GlobalScanData;
    use crate::timed::{TimedEffect, TimedEffects};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn grouped(uid: i64, group: &str) -> LoreEntry {
        LoreEntry {
            group: group.into(),
            ..LoreEntry::new(uid, format!("entry {uid}"))
        }
    }

    fn run(
        entries: &[LoreEntry],
        accepted: &[usize],
        settings: &LorebookSettings,
        chat: &[&str],
        seed: u64,
    ) -> Vec<usize> {
        run_with_effects(entries, accepted, settings, chat, TimedEffects::new(), seed)
    }

    fn run_with_effects(
        entries: &[LoreEntry],
        accepted: &[usize],
        settings: &LorebookSettings,
        chat: &[&str],
        mut effects: TimedEffects,
        seed: u64,
    ) -> Vec<usize> {
        let active: Vec<ActiveEntry> = entries.iter().map(|e| ActiveEntry::new("book", e)).collect();
        let buffer = ScanBuffer::new(chat.iter().copied(), GlobalScanData::default(), settings);
        let mut timed = TimedEffectsManager::new(&mut effects, chat.len());
        timed.check_timed_effects(&active);
        let scope = GroupScope {
            entries: &active,
            accepted,
            buffer: &buffer,
            timed: &timed,
            settings,
            state: ScanState::Initial,
        };
        let mut candidates: Vec<usize> = (0..active.len()).filter(|i| !accepted.contains(i)).collect();
        let mut rng = StdRng::seed_from_u64(seed);
        resolve_inclusion_groups(&mut candidates, &scope, &mut rng);
        candidates
    }

    #[test]
    fn test_weighted_pick_distribution() {
        let mut rng = StdRng::seed_from_u64(7);
        let trials = 100_000;
        let mut light = 0;
        for _ in 0..trials {
            if weighted_pick(&[1, 99], &mut rng) == Some(0) {
                light += 1;
            }
        }
        // Expect ~1%: 1000 +- a few standard deviations
        assert!((800..1200).contains(&light), "light picked {light} times");
    }

    #[test]
    fn test_one_winner_per_group() {
        let entries = vec![grouped(1, "a"), grouped(2, "a"), grouped(3, "a"), grouped(4, "")];
        for seed in 0..20 {
            let kept = run(&entries, &[], &LorebookSettings::default(), &[], seed);
            assert_eq!(kept.iter().filter(|&&i| i < 3).count(), 1);
            assert!(kept.contains(&3));
        }
    }

    #[test]
    fn test_override_wins_deterministically() {
        let mut entries = vec![grouped(1, "a"), grouped(2, "a"), grouped(3, "a")];
        entries[1].group_override = true;
        entries[2].group_override = true;
        for seed in 0..10 {
            assert_eq!(run(&entries, &[], &LorebookSettings::default(), &[], seed), vec![1]);
        }
    }

    #[test]
    fn test_group_filled_earlier_drops_all() {
        let entries = vec![grouped(1, "a, b"), grouped(2, "b"), grouped(3, "c")];
        let kept = run(&entries, &[0], &LorebookSettings::default(), &[], 1);
        assert_eq!(kept, vec![2]);
    }

    fn running(hash: u64) -> TimedEffect {
        TimedEffect {
            hash: EntryHash(hash),
            start: 0,
            end: 10,
            protected: false,
        }
    }

    #[test]
    fn test_sticky_member_wins_group() {
        let mut entries = vec![grouped(1, "a"), grouped(2, "a"), grouped(3, "a")];
        entries[1].sticky = 5;
        entries[2].group_override = true;
        let mut effects = TimedEffects::new();
        effects.sticky.insert("book.2".into(), running(2));

        for seed in 0..30 {
            let kept = run_with_effects(
                &entries,
                &[],
                &LorebookSettings::default(),
                &["x"],
                effects.clone(),
                seed,
            );
            assert_eq!(kept, vec![1]);
        }
    }

    #[test]
    fn test_cooldown_and_delay_members_drop_out() {
        let mut entries = vec![grouped(1, "a"), grouped(2, "a"), grouped(3, "a")];
        entries[0].delay = 5;
        entries[1].cooldown = 3;
        let mut effects = TimedEffects::new();
        effects.cooldown.insert("book.2".into(), running(2));

        for seed in 0..30 {
            let kept = run_with_effects(
                &entries,
                &[],
                &LorebookSettings::default(),
                &["x"],
                effects.clone(),
                seed,
            );
            assert_eq!(kept, vec![2]);
        }
    }

    #[test]
    fn test_scoring_keeps_best_match() {
        let mut entries = vec![grouped(1, "a"), grouped(2, "a")];
        entries[0].keys = vec!["storm".into()];
        entries[1].keys = vec!["storm".into(), "harbor".into()];
        let settings = LorebookSettings::default().with_group_scoring(true);
        for seed in 0..10 {
            let kept = run(&entries, &[], &settings, &["a storm over the harbor"], seed);
            assert_eq!(kept, vec![1]);
        }
    }
}
