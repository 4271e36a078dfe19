//! Activation engine
//!
//! Runs the multi-pass scan over merged lorebook entries: eligibility,
//! key matching, inclusion groups, probability and token budget, then
//! decides whether to recurse, widen the scan or stop.

mod groups;
mod output;

pub use output::{ActivatedEntry, ActivationOutput, AnchorPosition, DepthEntries, ExampleEntry};

use crate::collab::{MacroSubstitutor, NoMacros, NoPostProcessing, PostProcessor, TokenCounter};
use crate::lorebook::{
    activate_lorebooks, ActiveEntry, Character, Decorator, EntryHash, EntryKey, GenerationTrigger,
    Lorebook, LorebookSources, SelectiveLogic,
};
use crate::scan::{GlobalScanData, Haystack, ScanBuffer, ScanState};
use crate::settings::LorebookSettings;
use crate::timed::{EffectKind, TimedEffects, TimedEffectsManager};
use crate::{LoreError, Result};
use groups::{resolve_inclusion_groups, GroupScope};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Everything one turn's activation reads
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ActivationRequest {
    pub lorebooks: Vec<Lorebook>,
    pub sources: LorebookSources,
    /// Chat messages, oldest first
    pub chat: Vec<String>,
    pub character: Option<Character>,
    pub global_scan: GlobalScanData,
    /// Context size in tokens the budget is derived from
    pub max_context: usize,
    pub trigger: GenerationTrigger,
    /// Extra text scanned on every pass, e.g. from extensions
    pub inject: Vec<String>,
    /// Entries that activate this call regardless of their keys
    pub forced_activations: Vec<EntryKey>,
}

/// State of one activation call, dropped when the call returns
struct ActivationContext {
    state: ScanState,
    steps: usize,
    /// Indices of accepted entries, in acceptance order
    accepted: Vec<usize>,
    accepted_keys: HashSet<EntryKey>,
    failed_probability: HashSet<EntryHash>,
    accepted_text: String,
    overflowed: bool,
    pending_levels: VecDeque<u32>,
    current_level: u32,
}

impl ActivationContext {
    fn new(entries: &[ActiveEntry], recursive: bool) -> Self {
        let mut pending_levels: VecDeque<u32> = entries
            .iter()
            .filter_map(|e| e.entry.delay_until_recursion.level())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let current_level = if recursive {
            pending_levels.pop_front().unwrap_or(0)
        } else {
            0
        };

        Self {
            state: ScanState::Initial,
            steps: 0,
            accepted: Vec::new(),
            accepted_keys: HashSet::new(),
            failed_probability: HashSet::new(),
            accepted_text: String::new(),
            overflowed: false,
            pending_levels,
            current_level,
        }
    }

    fn is_done(&self, entry: &ActiveEntry) -> bool {
        self.accepted_keys.contains(&entry.key) || self.failed_probability.contains(&entry.hash)
    }

    fn accept(&mut self, index: usize, entry: &ActiveEntry) {
        self.accepted.push(index);
        self.accepted_keys.insert(entry.key.clone());
    }
}

/// Runs lorebook activation for one chat turn at a time.
///
/// Holds the settings and the host collaborators. It keeps no state between
/// calls: timed effects are passed in and updated by each call.
pub struct ActivationEngine {
    settings: LorebookSettings,
    tokens: Arc<dyn TokenCounter>,
    macros: Arc<dyn MacroSubstitutor>,
    post: Arc<dyn PostProcessor>,
    timeout: Option<Duration>,
}

impl ActivationEngine {
    pub fn new(settings: LorebookSettings, tokens: Arc<dyn TokenCounter>) -> Self {
        Self {
            settings,
            tokens,
            macros: Arc::new(NoMacros),
            post: Arc::new(NoPostProcessing),
            timeout: None,
        }
    }

    pub fn with_macros(mut self, macros: Arc<dyn MacroSubstitutor>) -> Self {
        self.macros = macros;
        self
    }

    pub fn with_post_processor(mut self, post: Arc<dyn PostProcessor>) -> Self {
        self.post = post;
        self
    }

    /// Fail calls that take longer than `timeout` overall
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn settings(&self) -> &LorebookSettings {
        &self.settings
    }

    /// Merge the request's lorebooks and run activation over them
    pub async fn activate<R: Rng + ?Sized>(
        &self,
        request: &ActivationRequest,
        effects: &mut TimedEffects,
        rng: &mut R,
    ) -> Result<Option<ActivationOutput>> {
        let entries = activate_lorebooks(
            &request.lorebooks,
            &request.sources,
            self.settings.insertion_strategy,
        );
        self.activate_lorebook_info(entries, request, effects, rng)
            .await
    }

    /// Run activation over already merged entries.
    ///
    /// Returns `None` when there is nothing to scan or no budget. `effects`
    /// is updated in place; the caller persists it.
    pub async fn activate_lorebook_info<R: Rng + ?Sized>(
        &self,
        mut entries: Vec<ActiveEntry>,
        request: &ActivationRequest,
        effects: &mut TimedEffects,
        rng: &mut R,
    ) -> Result<Option<ActivationOutput>> {
        let Some(budget) = self.settings.budget(request.max_context) else {
            debug!("No token budget for context {}", request.max_context);
            return Ok(None);
        };
        if entries.is_empty() {
            debug!("No lorebook entries to scan");
            return Ok(None);
        }

        let deadline = self.timeout.map(|t| Instant::now() + t);
        let settings = &self.settings;

        let mut buffer = ScanBuffer::new(
            request.chat.iter().rev(),
            request.global_scan.clone(),
            settings,
        );
        for text in &request.inject {
            buffer.add_inject(text.as_str());
        }

        let mut timed = TimedEffectsManager::new(effects, request.chat.len());
        timed.check_timed_effects(&entries);

        let forced: HashSet<&EntryKey> = request.forced_activations.iter().collect();
        let mut ctx = ActivationContext::new(&entries, settings.recursive_scan);

        debug!(
            "Activating over {} entries, budget {} tokens",
            entries.len(),
            budget
        );

        while ctx.state != ScanState::None {
            if settings.max_recursion_steps > 0 && ctx.steps >= settings.max_recursion_steps {
                debug!("Stopping after {} passes", ctx.steps);
                break;
            }
            ctx.steps += 1;
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(LoreError::DeadlineExceeded);
            }
            if ctx.state == ScanState::Recursion {
                buffer.consume_recurse();
            }

            let state = ctx.state;
            let mut candidates = Vec::new();
            for (i, active) in entries.iter().enumerate() {
                if ctx.is_done(active) || !self.is_eligible(active, state, &ctx, &timed, request) {
                    continue;
                }
                if self.activates(active, state, &buffer, &timed, &forced)? {
                    candidates.push(i);
                }
            }
            debug!("Pass {} ({}): {} candidates", ctx.steps, state, candidates.len());

            let scope = GroupScope {
                entries: &entries,
                accepted: &ctx.accepted,
                buffer: &buffer,
                timed: &timed,
                settings,
                state,
            };
            resolve_inclusion_groups(&mut candidates, &scope, rng);

            // Sticky entries first, merge order otherwise
            candidates
                .sort_by_key(|&i| (!timed.is_effect_active(EffectKind::Sticky, &entries[i]), i));

            let passed = self.roll_probability(candidates, &entries, &timed, &mut ctx, rng);
            let accepted_now = self
                .accept_within_budget(passed, &mut entries, &mut ctx, budget, deadline)
                .await?;

            let for_recursion: Vec<&str> = accepted_now
                .iter()
                .map(|&i| &entries[i])
                .filter(|e| !e.entry.prevent_recursion)
                .map(ActiveEntry::content)
                .collect();

            let next = self.next_state(
                &mut ctx,
                &mut buffer,
                !for_recursion.is_empty(),
                request.chat.len(),
            );
            if next != ScanState::None && settings.recursive_scan && !for_recursion.is_empty() {
                buffer.add_recurse(for_recursion.join("\n"));
            }
            ctx.state = next;
        }

        let output = output::assemble(&entries, &ctx.accepted, self.post.as_ref(), ctx.overflowed);
        timed.set_timed_effects(ctx.accepted.iter().map(|&i| &entries[i]));

        info!(
            "Activated {} lorebook entries in {} passes",
            ctx.accepted.len(),
            ctx.steps
        );
        Ok(Some(output))
    }

    fn is_eligible(
        &self,
        active: &ActiveEntry,
        state: ScanState,
        ctx: &ActivationContext,
        timed: &TimedEffectsManager<'_>,
        request: &ActivationRequest,
    ) -> bool {
        let entry = &active.entry;
        if entry.disabled {
            return false;
        }
        if entry.character_filter.rejects(request.character.as_ref()) {
            debug!("{} filtered out for this character", active.key);
            return false;
        }
        if !entry.triggers.is_empty() && !entry.triggers.contains(&request.trigger) {
            return false;
        }

        let sticky = timed.is_effect_active(EffectKind::Sticky, active);
        if timed.is_effect_active(EffectKind::Delay, active) {
            return false;
        }
        if timed.is_effect_active(EffectKind::Cooldown, active) && !sticky {
            debug!("{} is on cooldown", active.key);
            return false;
        }

        let level = entry.delay_until_recursion.level();
        if level.is_some() && !sticky {
            if state != ScanState::Recursion {
                return false;
            }
            if level.is_some_and(|l| l > ctx.current_level) {
                return false;
            }
        }
        if state == ScanState::Recursion
            && self.settings.recursive_scan
            && entry.exclude_recursion
            && !sticky
        {
            return false;
        }
        true
    }

    fn activates(
        &self,
        active: &ActiveEntry,
        state: ScanState,
        buffer: &ScanBuffer,
        timed: &TimedEffectsManager<'_>,
        forced: &HashSet<&EntryKey>,
    ) -> Result<bool> {
        let entry = &active.entry;
        if forced.contains(&active.key) {
            debug!("{} activated by request", active.key);
            return Ok(true);
        }
        if active.has_decorator(Decorator::Activate) {
            return Ok(true);
        }
        if active.has_decorator(Decorator::DontActivate) {
            return Ok(false);
        }
        if entry.constant || timed.is_effect_active(EffectKind::Sticky, active) {
            return Ok(true);
        }
        if entry.keys.is_empty() {
            return Ok(false);
        }

        let haystack = Haystack::new(buffer.get(active, state));
        let mut primary = false;
        for key in &entry.keys {
            if self.key_matches(&haystack, key, active, buffer)? {
                primary = true;
                break;
            }
        }
        if !primary {
            return Ok(false);
        }
        if !entry.selective || entry.secondary_keys.is_empty() {
            return Ok(true);
        }

        let logic = entry.selective_logic;
        let mut any = false;
        let mut all = true;
        for key in &entry.secondary_keys {
            let matched = self.key_matches(&haystack, key, active, buffer)?;
            match logic {
                SelectiveLogic::AndAny if matched => return Ok(true),
                SelectiveLogic::NotAll if !matched => return Ok(true),
                SelectiveLogic::NotAny if matched => return Ok(false),
                SelectiveLogic::AndAll if !matched => return Ok(false),
                _ => {}
            }
            any |= matched;
            all &= matched;
        }

        Ok(match logic {
            SelectiveLogic::NotAny => !any,
            SelectiveLogic::AndAll => all,
            SelectiveLogic::AndAny | SelectiveLogic::NotAll => false,
        })
    }

    fn key_matches(
        &self,
        haystack: &Haystack,
        key: &str,
        active: &ActiveEntry,
        buffer: &ScanBuffer,
    ) -> Result<bool> {
        let key = self.macros.substitute(key)?;
        let key = key.trim();
        Ok(!key.is_empty() && buffer.match_keys(haystack, key, active))
    }

    fn roll_probability<R: Rng + ?Sized>(
        &self,
        candidates: Vec<usize>,
        entries: &[ActiveEntry],
        timed: &TimedEffectsManager<'_>,
        ctx: &mut ActivationContext,
        rng: &mut R,
    ) -> Vec<usize> {
        let mut passed = Vec::with_capacity(candidates.len());
        for i in candidates {
            let active = &entries[i];
            let entry = &active.entry;
            let exempt = entry.constant
                || timed.is_effect_active(EffectKind::Sticky, active)
                || !entry.use_probability
                || entry.probability == 100;
            if exempt {
                passed.push(i);
                continue;
            }

            let roll: f64 = rng.gen_range(0.0..100.0);
            if roll <= entry.probability as f64 {
                passed.push(i);
            } else {
                debug!(
                    "{} failed probability roll ({:.1} > {})",
                    active.key, roll, entry.probability
                );
                ctx.failed_probability.insert(active.hash);
            }
        }
        passed
    }

    async fn accept_within_budget(
        &self,
        passed: Vec<usize>,
        entries: &mut [ActiveEntry],
        ctx: &mut ActivationContext,
        budget: usize,
        deadline: Option<Instant>,
    ) -> Result<Vec<usize>> {
        if passed.is_empty() {
            return Ok(Vec::new());
        }

        let prior = self.count_tokens(&ctx.accepted_text, deadline).await?;
        let mut running = String::new();
        let mut accepted_now = Vec::new();

        for i in passed {
            let content = self.macros.substitute(&entries[i].entry.content)?;
            running.push_str(&content);
            running.push('\n');
            entries[i].substituted = Some(content);

            let used = prior + self.count_tokens(&running, deadline).await?;
            if used >= budget {
                if self.settings.alert_on_overflow {
                    warn!(
                        "Lorebook budget of {} tokens exhausted at {}",
                        budget, entries[i].key
                    );
                } else {
                    debug!("Budget of {} tokens exhausted at {}", budget, entries[i].key);
                }
                ctx.overflowed = true;
                break;
            }
            ctx.accept(i, &entries[i]);
            accepted_now.push(i);
        }

        for &i in &accepted_now {
            ctx.accepted_text.push_str(entries[i].content());
            ctx.accepted_text.push('\n');
        }
        Ok(accepted_now)
    }

    fn next_state(
        &self,
        ctx: &mut ActivationContext,
        buffer: &mut ScanBuffer,
        has_recursion_text: bool,
        chat_length: usize,
    ) -> ScanState {
        let settings = &self.settings;

        if settings.recursive_scan && !ctx.overflowed && has_recursion_text {
            return ScanState::Recursion;
        }
        if ctx.state == ScanState::MinActivations && buffer.has_pending_recurse() {
            return ScanState::Recursion;
        }
        if ctx.accepted.len() < settings.min_activations {
            let depth = buffer.depth();
            let exhausted =
                (settings.max_depth > 0 && depth >= settings.max_depth) || depth >= chat_length;
            if !exhausted {
                buffer.advance_scan();
                debug!(
                    "Widening scan for min activations ({} < {})",
                    ctx.accepted.len(),
                    settings.min_activations
                );
                return ScanState::MinActivations;
            }
        }
        if settings.recursive_scan {
            if let Some(level) = ctx.pending_levels.pop_front() {
                debug!("Opening recursion delay level {}", level);
                ctx.current_level = level;
                return ScanState::Recursion;
            }
        }
        ScanState::None
    }

    async fn count_tokens(&self, text: &str, deadline: Option<Instant>) -> Result<usize> {
        let counting = self.tokens.count_tokens(text);
        match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, counting)
                .await
                .map_err(|_| LoreError::DeadlineExceeded)?,
            None => counting.await,
        }
    }
}
