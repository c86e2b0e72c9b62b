//! Thompson sampling over variant posteriors
//!
//! Every candidate draws `θ ~ Beta(alpha, beta)`; the draw is combined with
//! the variant's ROAS by a pluggable [`ValueScorer`] and the highest score
//! wins. Ties go to the lexicographically smallest id so that selection is
//! reproducible under a seeded RNG.

use std::sync::Arc;

use rand::Rng;
use rand_distr::{Beta, Distribution};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{AllocError, Result};
use crate::types::{Variant, VariantId};

use super::store::{VariantStore, lock_variant};

/// Combines a posterior draw with a variant's economics into a score
pub trait ValueScorer: Send + Sync {
    /// Score for a variant given its sampled success rate `theta`
    fn score(&self, theta: f64, variant: &Variant) -> f64;
}

/// Default scorer: `θ × (1 + weight · ln(1 + roas))`.
///
/// The log keeps one outlier ROAS from swamping the posterior draw, and a
/// variant with no spend yet scores on its posterior alone.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RoasWeighted {
    pub weight: f64,
}

impl Default for RoasWeighted {
    fn default() -> Self {
        Self { weight: 1.0 }
    }
}

impl RoasWeighted {
    pub fn value_multiplier(&self, roas: f64) -> f64 {
        1.0 + self.weight * roas.max(0.0).ln_1p()
    }
}

impl ValueScorer for RoasWeighted {
    fn score(&self, theta: f64, variant: &Variant) -> f64 {
        theta * self.value_multiplier(variant.roas)
    }
}

/// Plain Thompson sampling, ignoring ROAS
#[derive(Debug, Clone, Copy, Default)]
pub struct PosteriorOnly;

impl ValueScorer for PosteriorOnly {
    fn score(&self, theta: f64, _variant: &Variant) -> f64 {
        theta
    }
}

/// Outcome of one selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationDecision {
    pub variant_id: VariantId,
    /// Posterior draw for the winning variant
    pub theta: f64,
    /// Final score after the value multiplier
    pub score: f64,
    /// Number of variants that competed
    pub candidates: usize,
}

/// Draw from a variant's Beta posterior
pub fn sample_posterior<R: Rng + ?Sized>(alpha: f64, beta: f64, rng: &mut R) -> f64 {
    match Beta::new(alpha, beta) {
        Ok(dist) => dist.sample(rng),
        // Unreachable while alpha, beta >= 1; fall back to the mean
        Err(_) => alpha / (alpha + beta),
    }
}

/// Thompson sampler with a pluggable value scorer
#[derive(Clone)]
pub struct ThompsonSampler {
    scorer: Arc<dyn ValueScorer>,
}

impl Default for ThompsonSampler {
    fn default() -> Self {
        Self::new(Arc::new(RoasWeighted::default()))
    }
}

impl std::fmt::Debug for ThompsonSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThompsonSampler").finish_non_exhaustive()
    }
}

impl ThompsonSampler {
    pub fn new(scorer: Arc<dyn ValueScorer>) -> Self {
        Self { scorer }
    }

    /// Select from `pool` (or every non-archived variant) with the thread RNG
    pub fn select(
        &self,
        store: &VariantStore,
        pool: Option<&[VariantId]>,
    ) -> Result<AllocationDecision> {
        self.select_with_rng(store, pool, &mut rand::thread_rng())
    }

    /// Select with an explicit RNG
    pub fn select_with_rng<R: Rng + ?Sized>(
        &self,
        store: &VariantStore,
        pool: Option<&[VariantId]>,
        rng: &mut R,
    ) -> Result<AllocationDecision> {
        let cells = match pool {
            Some(ids) => {
                // Each variant gets exactly one draw however often it is listed
                let mut ids: Vec<&VariantId> = ids.iter().collect();
                ids.sort();
                ids.dedup();
                ids.into_iter()
                    .map(|id| store.cell(id.as_str()))
                    .collect::<Result<Vec<_>>>()?
            }
            None => store.cells(),
        };

        let mut best: Option<AllocationDecision> = None;
        let mut candidates = 0;
        for cell in &cells {
            // Copy what scoring needs and release the lock before sampling
            let variant = {
                let guard = lock_variant(cell);
                if guard.archived {
                    continue;
                }
                guard.clone()
            };
            candidates += 1;

            let theta = sample_posterior(variant.alpha, variant.beta, rng);
            let score = self.scorer.score(theta, &variant);
            trace!(variant_id = %variant.id, theta, score, "Sampled variant");

            let better = match &best {
                None => true,
                Some(current) => {
                    score > current.score
                        || (score == current.score && variant.id < current.variant_id)
                }
            };
            if better {
                best = Some(AllocationDecision {
                    variant_id: variant.id,
                    theta,
                    score,
                    candidates: 0,
                });
            }
        }

        best.map(|mut decision| {
            decision.candidates = candidates;
            decision
        })
        .ok_or_else(|| AllocError::NotFound("no selectable variants in pool".into()))
    }
}
