//! The allocation engine: one explicit context that owns every component
//! and the background tasks around them.

use std::sync::Arc;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bandit::{
    AllocationDecision, DecayReport, DecayScheduler, RoasWeighted, ThompsonSampler, ValueScorer,
    VariantStore, decay_all,
};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::evaluation::{
    ArtifactLoader, ChampionChallengerEvaluator, EvaluationCycle, EvaluationSource,
    JsonArtifactLoader, ModelPromotion, ModelRegistry, TestSet,
};
use crate::learning::{InstantLearner, LearnOutcome, LearnerHandle, OnlineModelState};
use crate::persistence::{
    EventLog, PersistenceHandle, PersistenceWriter, RetryPolicy, SnapshotStore, WriterStats,
    retry_with_backoff,
};
use crate::types::{Feedback, OutcomeMetrics, VariantId, VariantStats, validate_update};

/// Result of one feedback fan-out
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackOutcome {
    pub variant: VariantStats,
    pub learning: LearnOutcome,
}

/// Builder for [`AllocationEngine`]
pub struct EngineBuilder {
    config: EngineConfig,
    snapshot_store: Option<Arc<dyn SnapshotStore>>,
    event_log: Option<Arc<dyn EventLog>>,
    loader: Option<Arc<dyn ArtifactLoader>>,
    scorer: Option<Arc<dyn ValueScorer>>,
    evaluation_source: Option<Arc<dyn EvaluationSource>>,
}

impl EngineBuilder {
    /// Persist variant and registry snapshots; existing rows are restored on start
    pub fn snapshot_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.snapshot_store = Some(store);
        self
    }

    /// Append accepted learning events here when `storage.audit_log` is on
    pub fn event_log(mut self, log: Arc<dyn EventLog>) -> Self {
        self.event_log = Some(log);
        self
    }

    pub fn artifact_loader(mut self, loader: Arc<dyn ArtifactLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn scorer(mut self, scorer: Arc<dyn ValueScorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    /// Jobs for the periodic evaluation cycle when `evaluator.enabled` is on
    pub fn evaluation_source(mut self, source: Arc<dyn EvaluationSource>) -> Self {
        self.evaluation_source = Some(source);
        self
    }

    /// Validate the config, restore persisted state and start background tasks
    pub async fn start(self) -> Result<AllocationEngine> {
        let config = self.config;
        config.validate()?;
        let retry = RetryPolicy::from(&config.storage);

        let mut restored_variants = Vec::new();
        let mut restored_registry = Vec::new();
        if let Some(snapshots) = &self.snapshot_store {
            restored_variants =
                retry_with_backoff(retry, "load_variants", || snapshots.load_variants()).await?;
            restored_registry =
                retry_with_backoff(retry, "load_registry", || snapshots.load_registry()).await?;
        }

        // The writer outlives every producer so their last writes still land
        let writer_shutdown = CancellationToken::new();
        let event_log = self.event_log.filter(|_| config.storage.audit_log);
        let (persistence, writer_task) =
            PersistenceWriter::new(self.snapshot_store, event_log, retry)
                .spawn(writer_shutdown.clone());

        let store = Arc::new(VariantStore::with_persistence(persistence.clone()));
        let restored = store.restore(restored_variants);
        if restored > 0 || !restored_registry.is_empty() {
            info!(
                variants = restored,
                registry_rows = restored_registry.len(),
                "Restored engine state"
            );
        }

        let shutdown = CancellationToken::new();
        let mut tasks = Vec::new();

        let learner = InstantLearner::new(&config.learner, &config.drift);
        let (learner, learner_task) = LearnerHandle::spawn(
            learner,
            config.learner.queue_capacity,
            persistence.clone(),
            shutdown.clone(),
        );

        let registry = Arc::new(ModelRegistry::new(persistence.clone()));
        registry.restore(restored_registry);
        let loader = self
            .loader
            .unwrap_or_else(|| Arc::new(JsonArtifactLoader::new()));
        let evaluator = Arc::new(ChampionChallengerEvaluator::new(
            registry.clone(),
            loader,
            config.evaluator.clone(),
        ));

        if config.decay.enabled {
            let scheduler = DecayScheduler::new(store.clone(), &config.decay)?;
            tasks.push(scheduler.spawn(shutdown.clone()));
        }
        match (config.evaluator.enabled, self.evaluation_source) {
            (true, Some(source)) => {
                let cycle =
                    EvaluationCycle::new(evaluator.clone(), source, config.evaluator.interval());
                tasks.push(cycle.spawn(shutdown.clone()));
            }
            (true, None) => warn!("Evaluation cycle enabled but no evaluation source configured"),
            _ => {}
        }

        let sampler = match self.scorer {
            Some(scorer) => ThompsonSampler::new(scorer),
            None => ThompsonSampler::new(Arc::new(RoasWeighted {
                weight: config.bandit.roas_weight,
            })),
        };

        info!(
            background_tasks = tasks.len(),
            persistence = persistence.is_enabled(),
            "Allocation engine started"
        );

        Ok(AllocationEngine {
            config,
            store,
            sampler,
            learner,
            registry,
            evaluator,
            persistence,
            shutdown,
            writer_shutdown,
            tasks,
            learner_task,
            writer_task,
        })
    }
}

/// Adaptive allocation engine.
///
/// Constructed once per process and shared by reference; every operation
/// takes `&self`.
pub struct AllocationEngine {
    config: EngineConfig,
    store: Arc<VariantStore>,
    sampler: ThompsonSampler,
    learner: LearnerHandle,
    registry: Arc<ModelRegistry>,
    evaluator: Arc<ChampionChallengerEvaluator>,
    persistence: PersistenceHandle,
    shutdown: CancellationToken,
    writer_shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    learner_task: JoinHandle<InstantLearner>,
    writer_task: Option<JoinHandle<WriterStats>>,
}

impl AllocationEngine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            snapshot_store: None,
            event_log: None,
            loader: None,
            scorer: None,
            evaluation_source: None,
        }
    }

    /// In-memory engine with no storage attached
    pub async fn in_memory(config: EngineConfig) -> Result<Self> {
        Self::builder(config).start().await
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn variants(&self) -> &VariantStore {
        &self.store
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// Token cancelled by [`shutdown`](Self::shutdown)
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Register a variant with a uniform prior; `false` if it already existed
    pub fn register_variant(&self, variant_id: &str) -> Result<bool> {
        self.store.register(variant_id)
    }

    pub fn update_variant(
        &self,
        variant_id: &str,
        reward: f64,
        cost: f64,
        metrics: Option<&OutcomeMetrics>,
    ) -> Result<VariantStats> {
        let variant = self.store.update(variant_id, reward, cost, metrics)?;
        Ok(variant.stats())
    }

    /// Thompson-sample one variant from `pool`, or from every active variant
    pub fn select_variant(&self, pool: Option<&[VariantId]>) -> Result<AllocationDecision> {
        self.sampler.select(&self.store, pool)
    }

    /// [`select_variant`](Self::select_variant) with a caller-supplied RNG
    pub fn select_variant_with_rng<R: Rng + ?Sized>(
        &self,
        pool: Option<&[VariantId]>,
        rng: &mut R,
    ) -> Result<AllocationDecision> {
        self.sampler.select_with_rng(&self.store, pool, rng)
    }

    pub fn get_variant_stats(&self, variant_id: &str) -> Result<VariantStats> {
        self.store.stats(variant_id)
    }

    pub fn archive_variant(&self, variant_id: &str) -> Result<VariantStats> {
        let variant = self.store.archive(variant_id)?;
        Ok(variant.stats())
    }

    /// Discount every variant once, outside the scheduled cadence
    pub fn apply_decay(&self, factor: f64) -> Result<DecayReport> {
        let decayed = decay_all(&self.store, factor)?;
        let report = DecayReport {
            factor,
            variants_decayed: decayed.len(),
        };
        info!(factor, variants = report.variants_decayed, "Manual decay applied");
        Ok(report)
    }

    /// Fold a delivery report into both the bandit and the online learner.
    ///
    /// The bandit update is validated up front and committed only after the
    /// learner accepts the event, so a rejected step or a stopped learner
    /// leaves both sides untouched.
    pub async fn feedback(&self, feedback: &Feedback) -> Result<FeedbackOutcome> {
        feedback.validate()?;
        let event = feedback.to_learning_event();
        event.validate()?;
        let reward = feedback.reward();
        let metrics = feedback.metrics();
        validate_update(reward, feedback.spend, Some(&metrics))?;

        let learning = self.learner.learn(event).await?;
        let variant = self.update_variant(
            feedback.variant_id.as_str(),
            reward,
            feedback.spend,
            Some(&metrics),
        )?;
        Ok(FeedbackOutcome { variant, learning })
    }

    pub async fn learner_state(&self) -> Result<OnlineModelState> {
        self.learner.state().await
    }

    pub fn learner(&self) -> &LearnerHandle {
        &self.learner
    }

    /// Compare two artifacts and promote the challenger if it wins.
    ///
    /// The run is cancelled if the engine shuts down mid-evaluation.
    pub async fn evaluate(
        &self,
        family: &str,
        champion_artifact: &str,
        challenger_artifact: &str,
        test_set: &TestSet,
    ) -> Result<ModelPromotion> {
        self.evaluator
            .evaluate(
                family,
                champion_artifact,
                challenger_artifact,
                test_set,
                &self.shutdown,
            )
            .await
    }

    /// Wait until every write committed so far has reached storage
    pub async fn flush(&self) {
        self.persistence.flush().await;
    }

    /// Stop background tasks, then drain the write-behind queue
    pub async fn shutdown(self) -> Result<WriterStats> {
        info!("Allocation engine shutting down");
        self.shutdown.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task panicked");
            }
        }
        if let Err(e) = self.learner_task.await {
            warn!(error = %e, "Learner task panicked");
        }

        self.writer_shutdown.cancel();
        let stats = match self.writer_task {
            Some(task) => task.await.unwrap_or_else(|e| {
                warn!(error = %e, "Persistence writer panicked");
                WriterStats::default()
            }),
            None => WriterStats::default(),
        };
        info!(
            batches = stats.batches_written,
            failures = stats.write_failures,
            "Allocation engine stopped"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AllocError;
    use crate::persistence::InMemorySnapshotStore;

    fn config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.decay.enabled = false;
        config
    }

    fn feedback(variant: &str, clicks: u64, conversions: u64) -> Feedback {
        Feedback {
            ad_id: "ad-1".into(),
            variant_id: VariantId::new(variant).unwrap(),
            impressions: 1000,
            clicks,
            conversions,
            spend: 25.0,
            revenue: 80.0,
        }
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let engine = AllocationEngine::in_memory(config()).await.unwrap();
        assert!(engine.register_variant("A").unwrap());
        assert!(!engine.register_variant("A").unwrap());
        assert!(matches!(
            engine.register_variant("bad id"),
            Err(AllocError::Validation(_))
        ));
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_feedback_fans_out() {
        let engine = AllocationEngine::in_memory(config()).await.unwrap();
        let outcome = engine.feedback(&feedback("A", 10, 3)).await.unwrap();

        assert_eq!(outcome.variant.clicks, 10);
        assert_eq!(outcome.variant.conversions, 3);
        assert!((outcome.variant.alpha - 1.3).abs() < 1e-12);
        assert!((outcome.variant.roas - 3.2).abs() < 1e-12);
        assert_eq!(outcome.learning.prediction, 0.5);

        let state = engine.learner_state().await.unwrap();
        assert_eq!(state.events_seen, 1);
        assert!(state.weights.contains_key("ctr"));
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_learner_step_leaves_bandit_untouched() {
        let mut config = config();
        config.learner.learning_rate = 4.0;
        config.learner.learning_rate_cap = 4.0;
        let engine = AllocationEngine::in_memory(config).await.unwrap();

        // cpc = f64::MAX, so the first gradient step overflows
        let mut extreme = feedback("A", 1, 0);
        extreme.spend = f64::MAX;
        assert!(matches!(
            engine.feedback(&extreme).await,
            Err(AllocError::Validation(_))
        ));
        assert!(matches!(
            engine.get_variant_stats("A"),
            Err(AllocError::NotFound(_))
        ));
        assert_eq!(engine.learner_state().await.unwrap().events_seen, 0);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_stopped_learner_leaves_bandit_untouched() {
        let engine = AllocationEngine::in_memory(config()).await.unwrap();
        engine.shutdown_token().cancel();
        assert!(matches!(
            engine.feedback(&feedback("A", 10, 3)).await,
            Err(AllocError::Shutdown(_))
        ));
        assert!(matches!(
            engine.get_variant_stats("A"),
            Err(AllocError::NotFound(_))
        ));
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_feedback_mutates_nothing() {
        let engine = AllocationEngine::in_memory(config()).await.unwrap();
        let mut bad = feedback("A", 10, 3);
        bad.spend = f64::INFINITY;
        assert!(matches!(
            engine.feedback(&bad).await,
            Err(AllocError::Validation(_))
        ));
        assert!(matches!(
            engine.get_variant_stats("A"),
            Err(AllocError::NotFound(_))
        ));
        assert_eq!(engine.learner_state().await.unwrap().events_seen, 0);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_archived_variant_leaves_default_pool() {
        let engine = AllocationEngine::in_memory(config()).await.unwrap();
        engine.register_variant("A").unwrap();
        engine.register_variant("B").unwrap();
        engine.archive_variant("A").unwrap();
        for _ in 0..20 {
            assert_eq!(engine.select_variant(None).unwrap().variant_id.as_str(), "B");
        }
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_manual_decay_validates_factor() {
        let engine = AllocationEngine::in_memory(config()).await.unwrap();
        engine.update_variant("A", 1.0, 1.0, None).unwrap();
        assert!(engine.apply_decay(0.0).is_err());
        let report = engine.apply_decay(0.5).unwrap();
        assert_eq!(report.variants_decayed, 1);
        assert!((engine.get_variant_stats("A").unwrap().alpha - 1.0).abs() < 1e-12);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = config();
        config.decay.factor = 1.5;
        assert!(matches!(
            AllocationEngine::in_memory(config).await,
            Err(AllocError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_flushes_pending_writes() {
        let snapshots = Arc::new(InMemorySnapshotStore::new());
        let engine = AllocationEngine::builder(config())
            .snapshot_store(snapshots.clone())
            .start()
            .await
            .unwrap();
        for _ in 0..5 {
            engine.update_variant("A", 1.0, 2.0, None).unwrap();
        }
        engine.shutdown().await.unwrap();

        let rows = snapshots.load_variants().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].alpha, 6.0);
    }

    #[tokio::test]
    async fn test_operations_after_learner_shutdown() {
        let engine = AllocationEngine::in_memory(config()).await.unwrap();
        engine.shutdown_token().cancel();
        let result = engine.learner_state().await;
        assert!(matches!(result, Err(AllocError::Shutdown(_))));
        engine.shutdown().await.unwrap();
    }
}
