//! Timed effects: sticky, cooldown and delay timers that carry entry state
//! from one turn to the next.

mod effects;
mod manager;
mod store;

pub use effects::{EffectKind, TimedEffect, TimedEffects};
pub use manager::{EffectMetadata, TimedEffectsManager};
pub use store::{ChatEffects, EffectsSnapshot, TimedEffectsStore};
