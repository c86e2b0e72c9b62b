//! Learning events and outcome feedback
//!
//! Both records are produced by external collaborators (ad-platform
//! connectors, reporting jobs). A [`LearningEvent`] is immutable once built
//! and consumed exactly once by the learner; [`Feedback`] fans out into a
//! variant update plus a learning event.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AllocError, Result};

use super::variant::{OutcomeMetrics, VariantId};

/// Feature name to value
pub type FeatureVector = BTreeMap<String, f64>;

/// Event type emitted for feedback-derived learning events
pub const FEEDBACK_EVENT_TYPE: &str = "feedback";

/// Reject feature vectors that would corrupt a weight vector
pub fn validate_features(features: &FeatureVector) -> Result<()> {
    for (name, value) in features {
        if name.is_empty() {
            return Err(AllocError::Validation("feature name is empty".into()));
        }
        if !value.is_finite() {
            return Err(AllocError::Validation(format!(
                "feature {name:?} is not finite: {value}"
            )));
        }
    }
    Ok(())
}

/// One labelled observation for the online learner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningEvent {
    pub event_id: Uuid,
    pub ad_id: String,
    pub event_type: String,
    pub features: FeatureVector,
    /// 0/1 label or a continuous target
    pub outcome: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl LearningEvent {
    pub fn new(
        ad_id: impl Into<String>,
        event_type: impl Into<String>,
        features: FeatureVector,
        outcome: f64,
    ) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            ad_id: ad_id.into(),
            event_type: event_type.into(),
            features,
            outcome,
            timestamp: Utc::now(),
            metadata: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Hard validation; a failing event must not reach the learner
    pub fn validate(&self) -> Result<()> {
        if !self.outcome.is_finite() {
            return Err(AllocError::Validation(format!(
                "event {} outcome is not finite",
                self.event_id
            )));
        }
        validate_features(&self.features)
    }
}

/// Aggregated delivery outcome for one variant of one ad
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    pub ad_id: String,
    pub variant_id: VariantId,
    pub impressions: u64,
    pub clicks: u64,
    pub conversions: u64,
    pub spend: f64,
    pub revenue: f64,
}

impl Feedback {
    pub fn validate(&self) -> Result<()> {
        if !self.spend.is_finite() || self.spend < 0.0 {
            return Err(AllocError::Validation(format!(
                "spend must be finite and non-negative, got {}",
                self.spend
            )));
        }
        if !self.revenue.is_finite() || self.revenue < 0.0 {
            return Err(AllocError::Validation(format!(
                "revenue must be finite and non-negative, got {}",
                self.revenue
            )));
        }
        Ok(())
    }

    /// Bandit reward: conversions per click, clamped to [0, 1]
    pub fn reward(&self) -> f64 {
        if self.clicks == 0 {
            return 0.0;
        }
        (self.conversions as f64 / self.clicks as f64).clamp(0.0, 1.0)
    }

    pub fn metrics(&self) -> OutcomeMetrics {
        OutcomeMetrics {
            impressions: self.impressions,
            clicks: self.clicks,
            conversions: self.conversions,
            revenue: self.revenue,
        }
    }

    /// Features describing this delivery, all finite by construction
    pub fn features(&self) -> FeatureVector {
        let ratio = |num: f64, den: u64| if den == 0 { 0.0 } else { num / den as f64 };
        let mut features = FeatureVector::new();
        features.insert("ctr".into(), ratio(self.clicks as f64, self.impressions));
        features.insert("cvr".into(), ratio(self.conversions as f64, self.clicks));
        features.insert("cpc".into(), ratio(self.spend, self.clicks));
        features.insert("log_spend".into(), self.spend.ln_1p());
        features
    }

    /// Learning event labelled 1.0 when the delivery converted at all
    pub fn to_learning_event(&self) -> LearningEvent {
        let outcome = if self.conversions > 0 { 1.0 } else { 0.0 };
        LearningEvent::new(
            self.ad_id.clone(),
            FEEDBACK_EVENT_TYPE,
            self.features(),
            outcome,
        )
        .with_metadata("variant_id", self.variant_id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feedback(clicks: u64, conversions: u64) -> Feedback {
        Feedback {
            ad_id: "ad-1".into(),
            variant_id: VariantId::new("A").unwrap(),
            impressions: 1000,
            clicks,
            conversions,
            spend: 20.0,
            revenue: 60.0,
        }
    }

    #[test]
    fn test_event_validation_rejects_nan_and_inf() {
        let mut features = FeatureVector::new();
        features.insert("x".into(), f64::NAN);
        let event = LearningEvent::new("ad", "click", features, 1.0);
        assert!(matches!(event.validate(), Err(AllocError::Validation(_))));

        let mut features = FeatureVector::new();
        features.insert("x".into(), f64::NEG_INFINITY);
        let event = LearningEvent::new("ad", "click", features, 1.0);
        assert!(event.validate().is_err());
    }

    #[test]
    fn test_event_validation_rejects_non_finite_outcome() {
        let event = LearningEvent::new("ad", "click", FeatureVector::new(), f64::NAN);
        assert!(event.validate().is_err());
    }

    #[test]
    fn test_event_validation_rejects_empty_feature_name() {
        let mut features = FeatureVector::new();
        features.insert(String::new(), 1.0);
        let event = LearningEvent::new("ad", "click", features, 0.0);
        assert!(event.validate().is_err());
    }

    #[test]
    fn test_event_serialization_roundtrip() {
        let mut features = FeatureVector::new();
        features.insert("ctr".into(), 0.02);
        let event = LearningEvent::new("ad-9", "conversion", features, 1.0)
            .with_metadata("source", "meta");
        let json = serde_json::to_string(&event).unwrap();
        let parsed: LearningEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_feedback_reward_is_conversion_rate() {
        assert_eq!(feedback(10, 5).reward(), 0.5);
        assert_eq!(feedback(0, 0).reward(), 0.0);
        // More conversions than clicks (view-through) still caps at 1
        assert_eq!(feedback(2, 5).reward(), 1.0);
    }

    #[test]
    fn test_feedback_event_labels_conversions() {
        let converted = feedback(10, 1).to_learning_event();
        assert_eq!(converted.outcome, 1.0);
        assert_eq!(converted.event_type, FEEDBACK_EVENT_TYPE);
        assert_eq!(converted.metadata.get("variant_id").unwrap(), "A");
        assert!(converted.validate().is_ok());

        let missed = feedback(10, 0).to_learning_event();
        assert_eq!(missed.outcome, 0.0);
    }

    #[test]
    fn test_feedback_features_guard_zero_denominators() {
        let fb = Feedback {
            impressions: 0,
            clicks: 0,
            ..feedback(0, 0)
        };
        let features = fb.features();
        assert_eq!(features["ctr"], 0.0);
        assert_eq!(features["cvr"], 0.0);
        assert_eq!(features["cpc"], 0.0);
        assert!(validate_features(&features).is_ok());
    }

    #[test]
    fn test_feedback_validation() {
        let mut fb = feedback(1, 1);
        assert!(fb.validate().is_ok());
        fb.spend = -1.0;
        assert!(fb.validate().is_err());
        fb.spend = 1.0;
        fb.revenue = f64::NAN;
        assert!(fb.validate().is_err());
    }
}
