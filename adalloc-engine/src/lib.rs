//! adalloc-engine - Adaptive budget allocation
//!
//! This crate decides which ad-creative variant receives the next unit of
//! budget. It combines a Thompson-sampling bandit over Beta posteriors, an
//! online learner with drift detection, and an offline champion/challenger
//! evaluator that gates model promotion through a registry.

pub mod bandit;
pub mod config;
pub mod engine;
pub mod error;
pub mod evaluation;
pub mod learning;
pub mod persistence;
pub mod types;

pub use config::{
    BanditConfig, DecayConfig, DriftConfig, EngineConfig, EvaluatorConfig, LearnerConfig,
    StorageConfig,
};
pub use engine::{AllocationEngine, EngineBuilder, FeedbackOutcome};
pub use error::{AllocError, Result};
pub use types::*;

// Bandit re-exports
pub use bandit::{
    AllocationDecision, DecayReport, DecayScheduler, PosteriorOnly, RoasWeighted, ThompsonSampler,
    ValueScorer, VariantStore,
};

// Learning re-exports
pub use learning::{
    DriftDetector, InstantLearner, LearnOutcome, LearnerHandle, OnlineModelState, ReplaySummary,
};

// Evaluation re-exports
pub use evaluation::{
    ArtifactLoader, ChampionChallengerEvaluator, EvaluationJob, EvaluationSource,
    JsonArtifactLoader, LinearModel, ModelPromotion, ModelRegistry, ModelRegistryEntry,
    ModelStage, PromotionDecision, ScoringModel, TestSet,
};

// Persistence re-exports
pub use persistence::{
    EventLog, InMemoryEventLog, InMemorySnapshotStore, JsonFileStore, JsonlEventLog,
    SnapshotStore,
};
