//! Champion/challenger evaluation and the model registry

mod evaluator;
mod model;
mod registry;

pub use evaluator::{
    ChampionChallengerEvaluator, EvaluationCycle, EvaluationJob, EvaluationSource, ModelPromotion,
    PromotionDecision, TestSet, improvement_pct, simulate_roas,
};
pub use model::{ArtifactLoader, InMemoryArtifactLoader, JsonArtifactLoader, LinearModel, ScoringModel};
pub use registry::{ModelRegistry, ModelRegistryEntry, ModelStage, PromoteOutcome};
