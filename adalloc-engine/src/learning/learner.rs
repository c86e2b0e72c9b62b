//! Online logistic model updated one event at a time
//!
//! Each event takes a single SGD step on squared error through a sigmoid.
//! Losses feed the [`DriftDetector`]; when it fires the learning rate is
//! doubled (up to a cap) and every weight shrinks, so the model re-learns
//! quickly after a shift instead of defending stale weights.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{DriftConfig, LearnerConfig};
use crate::error::{AllocError, Result};
use crate::evaluation::LinearModel;
use crate::types::{FeatureVector, LearningEvent, validate_features};

use super::drift::DriftDetector;

/// Numerically stable logistic function
pub fn sigmoid(z: f64) -> f64 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}

/// Result of one learn step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnOutcome {
    pub event_id: Uuid,
    /// Prediction before the gradient step
    pub prediction: f64,
    pub loss: f64,
    pub drift_detected: bool,
    /// Learning rate after any drift boost
    pub learning_rate: f64,
}

/// Snapshot of the learner's parameters and drift window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OnlineModelState {
    pub weights: BTreeMap<String, f64>,
    pub bias: f64,
    pub learning_rate: f64,
    pub recent_losses: Vec<f64>,
    pub loss_variance: f64,
    pub events_seen: u64,
    pub drift_events: u64,
}

/// Totals from replaying an event log
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplaySummary {
    pub events_applied: usize,
    pub events_rejected: usize,
    pub drift_events: usize,
    pub mean_loss: f64,
}

/// Single-writer online learner
#[derive(Debug, Clone)]
pub struct InstantLearner {
    weights: BTreeMap<String, f64>,
    bias: f64,
    learning_rate: f64,
    learning_rate_cap: f64,
    drift_weight_decay: f64,
    detector: DriftDetector,
    events_seen: u64,
    drift_events: u64,
}

impl InstantLearner {
    pub fn new(config: &LearnerConfig, drift: &DriftConfig) -> Self {
        Self {
            weights: BTreeMap::new(),
            bias: 0.0,
            learning_rate: config.learning_rate,
            learning_rate_cap: config.learning_rate_cap.max(config.learning_rate),
            drift_weight_decay: config.drift_weight_decay,
            detector: DriftDetector::new(drift),
            events_seen: 0,
            drift_events: 0,
        }
    }

    /// Predict without learning
    pub fn predict(&self, features: &FeatureVector) -> Result<f64> {
        validate_features(features)?;
        Ok(sigmoid(self.linear_term(features)))
    }

    /// Take one gradient step on `event`.
    ///
    /// The event is fully validated, and the new parameters computed and
    /// checked, before anything is committed; a rejected event leaves the
    /// model untouched.
    pub fn learn_from_event(&mut self, event: &LearningEvent) -> Result<LearnOutcome> {
        event.validate()?;

        let prediction = sigmoid(self.linear_term(&event.features));
        let error = prediction - event.outcome;
        let loss = error * error;
        let step = self.learning_rate * error;

        let new_bias = self.bias - step;
        let new_weights = event
            .features
            .iter()
            .map(|(name, value)| {
                let current = self.weights.get(name).copied().unwrap_or(0.0);
                (name, current - step * value)
            })
            .collect::<Vec<_>>();
        if !new_bias.is_finite() || new_weights.iter().any(|(_, w)| !w.is_finite()) {
            return Err(AllocError::Validation(format!(
                "event {} would produce non-finite weights",
                event.event_id
            )));
        }

        self.bias = new_bias;
        for (name, weight) in new_weights {
            self.weights.insert(name.clone(), weight);
        }
        self.events_seen += 1;

        self.detector.add_element(loss);
        let drift_detected = self.detector.detected_change();
        if drift_detected {
            self.on_drift();
        }

        debug!(
            event_id = %event.event_id,
            prediction,
            loss,
            learning_rate = self.learning_rate,
            "Learned from event"
        );

        Ok(LearnOutcome {
            event_id: event.event_id,
            prediction,
            loss,
            drift_detected,
            learning_rate: self.learning_rate,
        })
    }

    /// Feed a sequence of events, skipping (and counting) invalid ones
    pub fn replay<I>(&mut self, events: I) -> ReplaySummary
    where
        I: IntoIterator<Item = LearningEvent>,
    {
        let mut summary = ReplaySummary::default();
        let mut loss_total = 0.0;
        for event in events {
            match self.learn_from_event(&event) {
                Ok(outcome) => {
                    summary.events_applied += 1;
                    loss_total += outcome.loss;
                    if outcome.drift_detected {
                        summary.drift_events += 1;
                    }
                }
                Err(e) => {
                    warn!(event_id = %event.event_id, error = %e, "Skipping event during replay");
                    summary.events_rejected += 1;
                }
            }
        }
        if summary.events_applied > 0 {
            summary.mean_loss = loss_total / summary.events_applied as f64;
        }
        summary
    }

    pub fn state(&self) -> OnlineModelState {
        OnlineModelState {
            weights: self.weights.clone(),
            bias: self.bias,
            learning_rate: self.learning_rate,
            recent_losses: self.detector.recent_losses().collect(),
            loss_variance: self.detector.variance(),
            events_seen: self.events_seen,
            drift_events: self.drift_events,
        }
    }

    /// Export the current parameters as an evaluator artifact
    pub fn to_artifact(&self) -> LinearModel {
        LinearModel {
            weights: self.weights.clone(),
            bias: self.bias,
        }
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    pub fn weight(&self, feature: &str) -> f64 {
        self.weights.get(feature).copied().unwrap_or(0.0)
    }

    pub fn bias(&self) -> f64 {
        self.bias
    }

    fn linear_term(&self, features: &FeatureVector) -> f64 {
        features.iter().fold(self.bias, |acc, (name, value)| {
            acc + self.weights.get(name).copied().unwrap_or(0.0) * value
        })
    }

    fn on_drift(&mut self) {
        let previous = self.learning_rate;
        self.learning_rate = (self.learning_rate * 2.0).min(self.learning_rate_cap);
        for weight in self.weights.values_mut() {
            *weight *= self.drift_weight_decay;
        }
        self.drift_events += 1;
        warn!(
            previous_rate = previous,
            learning_rate = self.learning_rate,
            loss_variance = self.detector.variance(),
            drift_events = self.drift_events,
            "Drift detected, boosting learning rate"
        );
    }
}
