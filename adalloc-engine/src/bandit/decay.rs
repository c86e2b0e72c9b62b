//! Periodic discounting of variant statistics
//!
//! Decay bounds how long old evidence influences selection, so creatives
//! that fatigue or lose ranking stop riding on historical wins. Each variant
//! is decayed under its own lock, the same lock `update()` takes, so a decay
//! pass and an update on one variant never interleave.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DecayConfig;
use crate::error::{AllocError, Result};
use crate::types::Variant;

use super::store::{VariantStore, lock_variant};

/// Summary of one decay pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecayReport {
    pub factor: f64,
    pub variants_decayed: usize,
}

/// Factors in (0, 1] are accepted; 1.0 leaves statistics unchanged
pub fn validate_decay_factor(factor: f64) -> Result<()> {
    if factor.is_finite() && factor > 0.0 && factor <= 1.0 {
        Ok(())
    } else {
        Err(AllocError::Validation(format!(
            "decay factor must be in (0, 1], got {factor}"
        )))
    }
}

/// Decay every variant once, returning the committed variants.
///
/// Each decayed row is queued for persistence before its lock is released.
pub fn decay_all(store: &VariantStore, factor: f64) -> Result<Vec<Variant>> {
    validate_decay_factor(factor)?;
    let decayed = store
        .cells()
        .iter()
        .map(|cell| {
            let mut variant = lock_variant(cell);
            variant.apply_decay(factor);
            store.record(&variant);
            variant.clone()
        })
        .collect::<Vec<_>>();
    debug!(factor, count = decayed.len(), "Decay pass applied");
    Ok(decayed)
}

/// Background task applying [`decay_all`] on a fixed interval
pub struct DecayScheduler {
    store: Arc<VariantStore>,
    factor: f64,
    interval: Duration,
}

impl DecayScheduler {
    pub fn new(store: Arc<VariantStore>, config: &DecayConfig) -> Result<Self> {
        validate_decay_factor(config.factor)?;
        if config.interval().is_zero() {
            return Err(AllocError::Validation("decay interval must be > 0".into()));
        }
        Ok(Self {
            store,
            factor: config.factor,
            interval: config.interval(),
        })
    }

    /// Run one pass
    pub fn tick(&self) -> Result<DecayReport> {
        let decayed = decay_all(&self.store, self.factor)?;
        Ok(DecayReport {
            factor: self.factor,
            variants_decayed: decayed.len(),
        })
    }

    /// Spawn the ticker; it exits when `shutdown` is cancelled
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately; decay starts one interval in
        ticker.tick().await;
        info!(
            interval_secs = self.interval.as_secs(),
            factor = self.factor,
            "Decay scheduler starting"
        );

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("Decay scheduler received shutdown signal");
                    return;
                }

                _ = ticker.tick() => {
                    match self.tick() {
                        Ok(report) => info!(
                            factor = report.factor,
                            variants = report.variants_decayed,
                            "Decay pass complete"
                        ),
                        Err(e) => warn!(error = %e, "Decay pass failed"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OutcomeMetrics;

    fn seeded_store() -> Arc<VariantStore> {
        let store = Arc::new(VariantStore::new());
        for _ in 0..20 {
            store
                .update("A", 1.0, 10.0, Some(&OutcomeMetrics::with_revenue(40.0)))
                .unwrap();
            store.update("B", 0.0, 5.0, None).unwrap();
        }
        store
    }

    #[test]
    fn test_unit_factor_is_noop() {
        let store = seeded_store();
        let before = store.stats("A").unwrap();
        decay_all(&store, 1.0).unwrap();
        let after = store.stats("A").unwrap();
        assert_eq!(before.alpha, after.alpha);
        assert_eq!(before.beta, after.beta);
        assert_eq!(before.spend, after.spend);
        assert_eq!(before.revenue, after.revenue);
    }

    #[test]
    fn test_tiny_factor_floors_at_prior() {
        let store = seeded_store();
        decay_all(&store, 1e-12).unwrap();
        for id in ["A", "B"] {
            let stats = store.stats(id).unwrap();
            assert_eq!(stats.alpha, 1.0);
            assert_eq!(stats.beta, 1.0);
        }
    }

    #[test]
    fn test_decay_scales_spend_and_revenue() {
        let store = seeded_store();
        decay_all(&store, 0.5).unwrap();
        let stats = store.stats("A").unwrap();
        assert!((stats.spend - 100.0).abs() < 1e-9);
        assert!((stats.revenue - 400.0).abs() < 1e-9);
        assert!((stats.roas - 4.0).abs() < 1e-9);
        assert!((stats.alpha - 10.5).abs() < 1e-9);
    }

    #[test]
    fn test_invalid_factors_rejected() {
        let store = seeded_store();
        for factor in [0.0, -0.5, 1.01, f64::NAN] {
            assert!(matches!(
                decay_all(&store, factor),
                Err(AllocError::Validation(_))
            ));
        }
        assert_eq!(store.stats("A").unwrap().alpha, 21.0);
    }

    #[test]
    fn test_interleaved_update_and_decay_keep_invariants() {
        let store = seeded_store();
        std::thread::scope(|s| {
            s.spawn(|| {
                for _ in 0..200 {
                    store.update("A", 0.3, 1.0, None).unwrap();
                }
            });
            s.spawn(|| {
                for _ in 0..200 {
                    decay_all(&store, 0.9).unwrap();
                }
            });
        });
        for variant in store.snapshot_all() {
            assert!(variant.alpha >= 1.0);
            assert!(variant.beta >= 1.0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_ticks_and_stops() {
        let store = seeded_store();
        let config = DecayConfig {
            enabled: true,
            interval_secs: 60,
            factor: 0.5,
        };
        let scheduler = DecayScheduler::new(store.clone(), &config).unwrap();
        let shutdown = CancellationToken::new();
        let handle = scheduler.spawn(shutdown.clone());

        tokio::time::sleep(Duration::from_secs(61)).await;
        tokio::task::yield_now().await;
        let alpha = store.stats("A").unwrap().alpha;
        assert!((alpha - 10.5).abs() < 1e-9, "expected one pass, alpha={alpha}");

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn test_scheduler_rejects_bad_config() {
        let store = Arc::new(VariantStore::new());
        let config = DecayConfig {
            enabled: true,
            interval_secs: 60,
            factor: 2.0,
        };
        assert!(DecayScheduler::new(store, &config).is_err());
    }
}
