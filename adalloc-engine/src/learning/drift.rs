//! Loss-variance drift detection
//!
//! # Relation to ADWIN
//!
//! This is an intentional approximation of ADWIN, not the published
//! algorithm. ADWIN bisects its window looking for the split point whose two
//! halves differ most; here the only candidate split is the newest check
//! interval:
//!
//! ```text
//! current = max(var(window), var(newest check_interval losses))
//! drift  <=>  len >= min_fill  &&  current > var_prev_check * multiplier
//! ```
//!
//! Checks run every `check_interval` losses so that the reference variance
//! lags the window by a full interval. The newest-interval term keeps a
//! shift visible once the window is full, when each interval moves the
//! whole-window variance by only `check_interval / window_size` of the
//! change. On drift the losses before the newest interval are dropped, as
//! ADWIN drops the stale side of its cut, and the survivors become the
//! reference.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::config::DriftConfig;

/// Variance below this is treated as zero when comparing ratios
const MIN_VARIANCE: f64 = 1e-12;

/// Sliding-window variance-ratio drift detector
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftDetector {
    window: VecDeque<f64>,
    capacity: usize,
    min_fill: usize,
    check_interval: usize,
    multiplier: f64,
    sum: f64,
    sum_sq: f64,
    /// Evictions since the running sums were last recomputed
    evictions: usize,
    /// Losses added since the last evaluated check
    since_check: usize,
    /// Variance recorded at the previous evaluated check
    reference_variance: Option<f64>,
}

impl Default for DriftDetector {
    fn default() -> Self {
        Self::new(&DriftConfig::default())
    }
}

impl DriftDetector {
    pub fn new(config: &DriftConfig) -> Self {
        let capacity = config.window_size.max(1);
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
            min_fill: config.min_fill.max(1),
            check_interval: config.check_interval.max(1),
            multiplier: config.variance_multiplier,
            sum: 0.0,
            sum_sq: 0.0,
            evictions: 0,
            since_check: 0,
            reference_variance: None,
        }
    }

    /// Append a loss, evicting the oldest beyond capacity
    pub fn add_element(&mut self, loss: f64) {
        self.window.push_back(loss);
        self.sum += loss;
        self.sum_sq += loss * loss;
        self.since_check += 1;

        if self.window.len() > self.capacity
            && let Some(old) = self.window.pop_front()
        {
            self.sum -= old;
            self.sum_sq -= old * old;
            self.evictions += 1;
            // Re-sum once per window turnover to shed accumulated rounding
            if self.evictions >= self.capacity {
                self.resum();
            }
        }
    }

    /// Whether window variance jumped since the previous check
    pub fn detected_change(&mut self) -> bool {
        if self.window.len() < self.min_fill || self.since_check < self.check_interval {
            return false;
        }
        self.since_check = 0;

        let current = self.variance().max(self.tail_variance(self.check_interval));
        let drift = match self.reference_variance {
            Some(reference) => {
                current > reference * self.multiplier && current > MIN_VARIANCE
            }
            None => false,
        };
        if drift {
            self.cut_to_tail(self.check_interval);
        }
        self.reference_variance = Some(self.variance());
        drift
    }

    /// Forget all history
    pub fn reset(&mut self) {
        self.window.clear();
        self.sum = 0.0;
        self.sum_sq = 0.0;
        self.evictions = 0;
        self.since_check = 0;
        self.reference_variance = None;
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn mean(&self) -> f64 {
        if self.window.is_empty() {
            0.0
        } else {
            self.sum / self.window.len() as f64
        }
    }

    /// Population variance of the window
    pub fn variance(&self) -> f64 {
        let n = self.window.len();
        if n == 0 {
            return 0.0;
        }
        let mean = self.mean();
        (self.sum_sq / n as f64 - mean * mean).max(0.0)
    }

    pub fn reference_variance(&self) -> Option<f64> {
        self.reference_variance
    }

    /// Most recent losses, oldest first
    pub fn recent_losses(&self) -> impl Iterator<Item = f64> + '_ {
        self.window.iter().copied()
    }

    /// Population variance of the newest `n` losses
    fn tail_variance(&self, n: usize) -> f64 {
        let n = n.min(self.window.len());
        if n == 0 {
            return 0.0;
        }
        let (sum, sum_sq) = self
            .window
            .iter()
            .rev()
            .take(n)
            .fold((0.0, 0.0), |(s, sq), x| (s + x, sq + x * x));
        let mean = sum / n as f64;
        (sum_sq / n as f64 - mean * mean).max(0.0)
    }

    /// Keep only the newest `n` losses
    fn cut_to_tail(&mut self, n: usize) {
        let stale = self.window.len().saturating_sub(n);
        self.window.drain(..stale);
        self.resum();
    }

    fn resum(&mut self) {
        self.sum = self.window.iter().sum();
        self.sum_sq = self.window.iter().map(|x| x * x).sum();
        self.evictions = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Alternating losses around 0.5 with the given half-spread
    fn alternating(detector: &mut DriftDetector, count: usize, spread: f64) -> bool {
        let mut fired = false;
        for i in 0..count {
            let loss = if i % 2 == 0 { 0.5 + spread } else { 0.5 - spread };
            detector.add_element(loss);
            fired |= detector.detected_change();
        }
        fired
    }

    #[test]
    fn test_quiet_below_min_fill() {
        let mut detector = DriftDetector::default();
        for i in 0..49 {
            detector.add_element(if i % 2 == 0 { 0.0 } else { 1.0 });
            assert!(!detector.detected_change());
        }
    }

    #[test]
    fn test_constant_variance_never_fires() {
        let mut detector = DriftDetector::default();
        assert!(!alternating(&mut detector, 3000, 0.1));
        assert_eq!(detector.len(), 1000);
    }

    #[test]
    fn test_sustained_variance_spike_fires() {
        let mut detector = DriftDetector::default();
        assert!(!alternating(&mut detector, 50, 0.1));
        // Three times the variance: spread scaled by sqrt(3)
        assert!(alternating(&mut detector, 50, 0.1 * 3f64.sqrt()));
    }

    #[test]
    fn test_spike_fires_in_small_window_after_long_baseline() {
        let config = DriftConfig {
            window_size: 100,
            ..Default::default()
        };
        let mut detector = DriftDetector::new(&config);
        assert!(!alternating(&mut detector, 1000, 0.05));
        assert!(alternating(&mut detector, 50, 0.05 * 3f64.sqrt()));
    }

    #[test]
    fn test_spike_fires_once_after_full_window_baseline() {
        let mut detector = DriftDetector::default();
        assert!(!alternating(&mut detector, 2000, 0.1));
        assert_eq!(detector.len(), 1000);

        let spread = 0.1 * 3f64.sqrt();
        let mut fires = Vec::new();
        for i in 0..1000 {
            let loss = if i % 2 == 0 { 0.5 + spread } else { 0.5 - spread };
            detector.add_element(loss);
            if detector.detected_change() {
                fires.push(i);
            }
        }
        // Fires at the first check inside the new regime, then adopts it
        assert_eq!(fires, vec![49]);
        let reference = detector.reference_variance().unwrap();
        assert!((reference - 0.03).abs() < 1e-9);
    }

    #[test]
    fn test_drift_drops_losses_before_newest_interval() {
        let mut detector = DriftDetector::default();
        alternating(&mut detector, 500, 0.05);
        assert!(alternating(&mut detector, 50, 0.2));
        assert_eq!(detector.len(), 50);
        assert!((detector.variance() - 0.04).abs() < 1e-9);
    }

    #[test]
    fn test_window_is_bounded() {
        let config = DriftConfig {
            window_size: 10,
            min_fill: 5,
            ..Default::default()
        };
        let mut detector = DriftDetector::new(&config);
        for i in 0..25 {
            detector.add_element(i as f64);
        }
        assert_eq!(detector.len(), 10);
        assert_eq!(detector.recent_losses().next(), Some(15.0));
        assert!((detector.mean() - 19.5).abs() < 1e-9);
    }

    #[test]
    fn test_running_variance_matches_direct_computation() {
        let config = DriftConfig {
            window_size: 64,
            ..DriftConfig::default()
        };
        let mut detector = DriftDetector::new(&config);
        for i in 0..1000 {
            detector.add_element(((i * 37) % 101) as f64 / 101.0);
        }
        let values: Vec<f64> = detector.recent_losses().collect();
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let var = values.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / values.len() as f64;
        assert!((detector.variance() - var).abs() < 1e-9);
    }

    #[test]
    fn test_reset_clears_reference() {
        let mut detector = DriftDetector::default();
        alternating(&mut detector, 100, 0.1);
        assert!(detector.reference_variance().is_some());
        detector.reset();
        assert!(detector.is_empty());
        assert!(detector.reference_variance().is_none());
        assert_eq!(detector.variance(), 0.0);
    }
}
