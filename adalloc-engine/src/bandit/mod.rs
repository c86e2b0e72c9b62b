//! Budget allocation across ad-creative variants
//!
//! This module implements variant selection via Thompson sampling over
//! Beta posteriors, with periodic decay so the bandit keeps adapting to
//! creative fatigue and market shifts.

mod decay;
mod sampler;
mod store;

pub use decay::{DecayReport, DecayScheduler, decay_all, validate_decay_factor};
pub use sampler::{
    AllocationDecision, PosteriorOnly, RoasWeighted, ThompsonSampler, ValueScorer,
    sample_posterior,
};
pub use store::VariantStore;
