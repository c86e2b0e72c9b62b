//! Core data types shared across the engine

mod event;
mod variant;

pub use event::{
    FEEDBACK_EVENT_TYPE, FeatureVector, Feedback, LearningEvent, validate_features,
};
pub use variant::{
    MAX_VARIANT_ID_LEN, OutcomeMetrics, PRIOR, Variant, VariantId, VariantStats, compute_roas,
    validate_update,
};
