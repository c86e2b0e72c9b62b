//! Offline champion/challenger comparison
//!
//! Both artifacts are scored against the same test set by simulating which
//! rows they would fund. The challenger is promoted only when its ROAS beats
//! the champion's by more than the configured margin.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EvaluatorConfig;
use crate::error::{AllocError, Result};
use crate::types::{FeatureVector, validate_features};

use super::model::{ArtifactLoader, ScoringModel};
use super::registry::{ModelRegistry, PromoteOutcome};

/// Held-out rows: features plus the revenue and spend each row produced
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestSet {
    pub features: Vec<FeatureVector>,
    pub revenue: Vec<f64>,
    pub spend: Vec<f64>,
}

impl TestSet {
    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        if self.revenue.len() != self.features.len() || self.spend.len() != self.features.len() {
            return Err(AllocError::Validation(format!(
                "test set columns differ in length: features={}, revenue={}, spend={}",
                self.features.len(),
                self.revenue.len(),
                self.spend.len()
            )));
        }
        for (row, (revenue, spend)) in self.revenue.iter().zip(&self.spend).enumerate() {
            if !revenue.is_finite() || *revenue < 0.0 || !spend.is_finite() || *spend < 0.0 {
                return Err(AllocError::Validation(format!(
                    "test set row {row}: revenue and spend must be finite and >= 0"
                )));
            }
        }
        for features in &self.features {
            validate_features(features)?;
        }
        Ok(())
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path).await?;
        let test_set: Self = serde_json::from_slice(&bytes)
            .map_err(|e| AllocError::Serialization(format!("{}: {e}", path.display())))?;
        test_set.validate()?;
        Ok(test_set)
    }
}

/// Simulated return on ad spend of `model` over `test_set`.
///
/// Rows whose prediction exceeds `threshold` keep their revenue; spend counts
/// for every row. Scoring runs `batch_size` rows at a time and checks
/// `cancel` between batches.
pub async fn simulate_roas(
    model: &dyn ScoringModel,
    test_set: &TestSet,
    threshold: f64,
    batch_size: usize,
    cancel: &CancellationToken,
) -> Result<f64> {
    let batch_size = batch_size.max(1);
    let mut allocated = 0.0;
    for (start, batch) in (0..).step_by(batch_size).zip(test_set.features.chunks(batch_size)) {
        if cancel.is_cancelled() {
            return Err(AllocError::Cancelled);
        }
        let predictions = model.predict(batch);
        if predictions.len() != batch.len() {
            return Err(AllocError::Validation(format!(
                "model returned {} predictions for {} rows",
                predictions.len(),
                batch.len()
            )));
        }
        allocated += predictions
            .iter()
            .zip(&test_set.revenue[start..start + batch.len()])
            .filter(|(prediction, _)| **prediction > threshold)
            .map(|(_, revenue)| revenue)
            .sum::<f64>();
        tokio::task::yield_now().await;
    }

    let total_spend: f64 = test_set.spend.iter().sum();
    if total_spend > 0.0 {
        Ok(allocated / total_spend)
    } else {
        Ok(0.0)
    }
}

/// Percent change from champion to challenger; `None` when the champion
/// earned nothing
pub fn improvement_pct(champion_roas: f64, challenger_roas: f64) -> Option<f64> {
    (champion_roas > 0.0).then(|| (challenger_roas - champion_roas) / champion_roas * 100.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromotionDecision {
    Promoted,
    Retained,
    /// Another evaluation changed the champion first; nothing was written
    Conflict,
}

/// Outcome of one evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPromotion {
    pub model_family: String,
    pub champion_artifact: String,
    pub challenger_artifact: String,
    pub champion_roas: f64,
    pub challenger_roas: f64,
    pub improvement_pct: Option<f64>,
    pub decision: PromotionDecision,
}

impl ModelPromotion {
    pub fn promoted(&self) -> bool {
        self.decision == PromotionDecision::Promoted
    }
}

pub struct ChampionChallengerEvaluator {
    registry: Arc<ModelRegistry>,
    loader: Arc<dyn ArtifactLoader>,
    config: EvaluatorConfig,
}

impl ChampionChallengerEvaluator {
    pub fn new(
        registry: Arc<ModelRegistry>,
        loader: Arc<dyn ArtifactLoader>,
        config: EvaluatorConfig,
    ) -> Self {
        Self {
            registry,
            loader,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    /// Compare two artifacts and promote the challenger if it wins.
    ///
    /// When the family already has a champion, the promotion only lands if
    /// that champion is still `champion_artifact` at commit time; otherwise
    /// the result is [`PromotionDecision::Conflict`]. Nothing in the registry
    /// changes unless the decision is `Promoted`.
    pub async fn evaluate(
        &self,
        family: &str,
        champion_artifact: &str,
        challenger_artifact: &str,
        test_set: &TestSet,
        cancel: &CancellationToken,
    ) -> Result<ModelPromotion> {
        if champion_artifact == challenger_artifact {
            return Err(AllocError::Validation(
                "champion and challenger must be different artifacts".into(),
            ));
        }
        test_set.validate()?;

        let expected_champion = self
            .registry
            .champion(family)
            .map(|_| champion_artifact.to_string());

        let (champion, challenger) = tokio::try_join!(
            self.loader.load(champion_artifact),
            self.loader.load(challenger_artifact)
        )?;

        let threshold = self.config.prediction_threshold;
        let batch = self.config.batch_size;
        let champion_roas =
            simulate_roas(champion.as_ref(), test_set, threshold, batch, cancel).await?;
        let challenger_roas =
            simulate_roas(challenger.as_ref(), test_set, threshold, batch, cancel).await?;

        let improvement = improvement_pct(champion_roas, challenger_roas);
        let wins = match improvement {
            Some(pct) => pct > self.config.promotion_threshold_pct,
            None => challenger_roas > 0.0,
        };
        debug!(
            family,
            champion_roas,
            challenger_roas,
            improvement_pct = improvement,
            "Scored champion and challenger"
        );

        let decision = if !wins {
            PromotionDecision::Retained
        } else {
            if cancel.is_cancelled() {
                return Err(AllocError::Cancelled);
            }
            match self.registry.promote(
                family,
                challenger_artifact,
                expected_champion.as_deref(),
            )? {
                PromoteOutcome::Promoted { .. } => PromotionDecision::Promoted,
                PromoteOutcome::Conflict { current } => {
                    warn!(
                        family,
                        challenger = challenger_artifact,
                        current = current.as_deref(),
                        "Champion changed during evaluation, promotion skipped"
                    );
                    PromotionDecision::Conflict
                }
            }
        };

        info!(
            family,
            champion = champion_artifact,
            challenger = challenger_artifact,
            champion_roas,
            challenger_roas,
            decision = ?decision,
            "Evaluation complete"
        );

        Ok(ModelPromotion {
            model_family: family.to_string(),
            champion_artifact: champion_artifact.to_string(),
            challenger_artifact: challenger_artifact.to_string(),
            champion_roas,
            challenger_roas,
            improvement_pct: improvement,
            decision,
        })
    }
}

/// One queued comparison
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationJob {
    pub model_family: String,
    pub champion_artifact: String,
    pub challenger_artifact: String,
    pub test_set: TestSet,
}

/// Supplies work to the periodic evaluation cycle
#[async_trait]
pub trait EvaluationSource: Send + Sync {
    /// Jobs to run this cycle; an empty list skips the cycle
    async fn pending_jobs(&self) -> Result<Vec<EvaluationJob>>;
}

/// Background task running queued evaluations on a fixed interval
pub struct EvaluationCycle {
    evaluator: Arc<ChampionChallengerEvaluator>,
    source: Arc<dyn EvaluationSource>,
    interval: Duration,
}

impl EvaluationCycle {
    pub fn new(
        evaluator: Arc<ChampionChallengerEvaluator>,
        source: Arc<dyn EvaluationSource>,
        interval: Duration,
    ) -> Self {
        Self {
            evaluator,
            source,
            interval,
        }
    }

    /// Run every pending job once; stops early on cancellation
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<Vec<ModelPromotion>> {
        let jobs = self.source.pending_jobs().await?;
        let mut results = Vec::with_capacity(jobs.len());
        for job in jobs {
            let result = self
                .evaluator
                .evaluate(
                    &job.model_family,
                    &job.champion_artifact,
                    &job.challenger_artifact,
                    &job.test_set,
                    cancel,
                )
                .await;
            match result {
                Ok(promotion) => results.push(promotion),
                Err(AllocError::Cancelled) => return Err(AllocError::Cancelled),
                Err(e) => warn!(
                    family = %job.model_family,
                    challenger = %job.challenger_artifact,
                    error = %e,
                    "Evaluation job failed"
                ),
            }
        }
        Ok(results)
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;
        info!(
            interval_secs = self.interval.as_secs(),
            "Evaluation cycle starting"
        );

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("Evaluation cycle received shutdown signal");
                    return;
                }

                _ = ticker.tick() => {
                    match self.run_once(&shutdown).await {
                        Ok(results) => {
                            let promoted = results.iter().filter(|r| r.promoted()).count();
                            info!(jobs = results.len(), promoted, "Evaluation cycle complete");
                        }
                        Err(AllocError::Cancelled) => {
                            info!("Evaluation cycle cancelled mid-run");
                            return;
                        }
                        Err(e) => warn!(error = %e, "Evaluation cycle failed"),
                    }
                }
            }
        }
    }
}
