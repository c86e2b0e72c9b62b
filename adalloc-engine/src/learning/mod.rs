//! Online re-estimation of expected return
//!
//! An [`InstantLearner`] takes one gradient step per [`LearningEvent`] and
//! watches its own loss stream through a [`DriftDetector`]. It is owned by a
//! single task behind a [`LearnerHandle`].
//!
//! [`LearningEvent`]: crate::types::LearningEvent

mod actor;
mod drift;
mod learner;

pub use actor::LearnerHandle;
pub use drift::DriftDetector;
pub use learner::{InstantLearner, LearnOutcome, OnlineModelState, ReplaySummary, sigmoid};
