//! In-memory registry of bandit arms
//!
//! Each variant sits behind its own mutex. The outer map is read-locked for
//! lookups and write-locked only to insert a variant that does not exist
//! yet, so updates to different variants never contend.
//!
//! Committed rows are handed to the write-behind writer while the variant's
//! lock is still held, so the writer receives them in commit order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use tracing::{debug, info};

use crate::error::{AllocError, Result};
use crate::persistence::PersistenceHandle;
use crate::types::{OutcomeMetrics, Variant, VariantId, VariantStats, validate_update};

/// Shared handle to one variant's lock
pub(crate) type VariantCell = Arc<Mutex<Variant>>;

/// Lock a variant, recovering the data if a previous holder panicked
pub(crate) fn lock_variant(cell: &VariantCell) -> MutexGuard<'_, Variant> {
    cell.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Registry of variants and their sufficient statistics
#[derive(Debug, Default)]
pub struct VariantStore {
    variants: RwLock<HashMap<VariantId, VariantCell>>,
    persistence: PersistenceHandle,
}

impl VariantStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store whose committed rows are queued on `persistence`
    pub fn with_persistence(persistence: PersistenceHandle) -> Self {
        Self {
            variants: RwLock::default(),
            persistence,
        }
    }

    /// Create a variant with a uniform prior if it does not exist.
    ///
    /// Returns `true` when a new variant was created.
    pub fn register(&self, variant_id: &str) -> Result<bool> {
        let id = VariantId::new(variant_id)?;
        let (_, created) = self.get_or_register(&id);
        Ok(created)
    }

    /// Fold an outcome into a variant, registering it lazily.
    ///
    /// Returns the variant as committed, for write-behind persistence.
    pub fn update(
        &self,
        variant_id: &str,
        reward: f64,
        cost: f64,
        metrics: Option<&OutcomeMetrics>,
    ) -> Result<Variant> {
        let id = VariantId::new(variant_id)?;
        validate_update(reward, cost, metrics)?;

        let (cell, _) = self.get_or_register(&id);
        let mut variant = lock_variant(&cell);
        variant.apply_update(reward, cost, metrics);
        debug!(
            variant_id = %id,
            reward,
            cost,
            alpha = variant.alpha,
            beta = variant.beta,
            "Variant updated"
        );
        self.record(&variant);
        Ok(variant.clone())
    }

    /// Consistent snapshot of one variant's statistics
    pub fn stats(&self, variant_id: &str) -> Result<VariantStats> {
        self.get(variant_id).map(|v| v.stats())
    }

    /// Consistent copy of one variant
    pub fn get(&self, variant_id: &str) -> Result<Variant> {
        let cell = self.cell(variant_id)?;
        let variant = lock_variant(&cell);
        Ok(variant.clone())
    }

    /// Exclude a variant from the default selection pool
    pub fn archive(&self, variant_id: &str) -> Result<Variant> {
        let cell = self.cell(variant_id)?;
        let mut variant = lock_variant(&cell);
        if !variant.archived {
            variant.archived = true;
            info!(variant_id = %variant.id, "Variant archived");
            self.record(&variant);
        }
        Ok(variant.clone())
    }

    /// Queue a committed row; callers hold the variant's lock
    pub(crate) fn record(&self, variant: &Variant) {
        if self.persistence.is_enabled() {
            self.persistence.record_variant(variant.clone());
        }
    }

    /// Load persisted variants, keeping any that already exist in memory.
    ///
    /// Restored rows are already stored and are not queued again.
    pub fn restore(&self, variants: impl IntoIterator<Item = Variant>) -> usize {
        let mut map = self
            .variants
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let mut restored = 0;
        for mut variant in variants {
            variant.alpha = variant.alpha.max(crate::types::PRIOR);
            variant.beta = variant.beta.max(crate::types::PRIOR);
            if let std::collections::hash_map::Entry::Vacant(slot) = map.entry(variant.id.clone()) {
                slot.insert(Arc::new(Mutex::new(variant)));
                restored += 1;
            }
        }
        restored
    }

    /// Copy of every variant, each taken under its own lock
    pub fn snapshot_all(&self) -> Vec<Variant> {
        self.cells()
            .iter()
            .map(|cell| lock_variant(cell).clone())
            .collect()
    }

    pub fn ids(&self) -> Vec<VariantId> {
        let map = self.variants.read().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<_> = map.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.variants
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Handle to a registered variant's lock
    pub(crate) fn cell(&self, variant_id: &str) -> Result<VariantCell> {
        let map = self.variants.read().unwrap_or_else(PoisonError::into_inner);
        map.get(variant_id)
            .cloned()
            .ok_or_else(|| AllocError::NotFound(format!("variant {variant_id}")))
    }

    /// Handles to every variant; the map lock is released before returning
    pub(crate) fn cells(&self) -> Vec<VariantCell> {
        let map = self.variants.read().unwrap_or_else(PoisonError::into_inner);
        map.values().cloned().collect()
    }

    fn get_or_register(&self, id: &VariantId) -> (VariantCell, bool) {
        {
            let map = self.variants.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(cell) = map.get(id) {
                return (cell.clone(), false);
            }
        }

        let mut map = self
            .variants
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        // Another writer may have inserted between the two locks
        if let Some(cell) = map.get(id) {
            return (cell.clone(), false);
        }
        let variant = Variant::new(id.clone());
        // No other thread can reach the cell before the map lock is released
        self.record(&variant);
        let cell = Arc::new(Mutex::new(variant));
        map.insert(id.clone(), cell.clone());
        info!(variant_id = %id, "Variant registered");
        (cell, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_register_is_idempotent() {
        let store = VariantStore::new();
        assert!(store.register("A").unwrap());
        store.update("A", 1.0, 1.0, None).unwrap();
        assert!(!store.register("A").unwrap());
        assert_eq!(store.stats("A").unwrap().alpha, 2.0);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_register_rejects_malformed_id() {
        let store = VariantStore::new();
        assert!(matches!(
            store.register("not valid"),
            Err(AllocError::Validation(_))
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn test_update_lazily_registers() {
        let store = VariantStore::new();
        store.update("fresh", 0.0, 2.0, None).unwrap();
        let stats = store.stats("fresh").unwrap();
        assert_eq!(stats.alpha, 1.0);
        assert_eq!(stats.beta, 2.0);
        assert_eq!(stats.spend, 2.0);
    }

    #[test]
    fn test_rejected_update_leaves_no_trace() {
        let store = VariantStore::new();
        assert!(store.update("A", 0.5, -1.0, None).is_err());
        assert!(store.is_empty(), "invalid update must not register");

        store.register("A").unwrap();
        assert!(store.update("A", 2.0, 1.0, None).is_err());
        let stats = store.stats("A").unwrap();
        assert_eq!((stats.alpha, stats.beta, stats.spend), (1.0, 1.0, 0.0));
    }

    #[test]
    fn test_counts_are_exact() {
        let store = VariantStore::new();
        for _ in 0..7 {
            store.update("A", 1.0, 0.0, None).unwrap();
        }
        for _ in 0..4 {
            store.update("A", 0.0, 0.0, None).unwrap();
        }
        let stats = store.stats("A").unwrap();
        assert_eq!(stats.alpha, 8.0);
        assert_eq!(stats.beta, 5.0);
    }

    #[test]
    fn test_stats_unknown_variant_is_not_found() {
        let store = VariantStore::new();
        assert!(matches!(store.stats("ghost"), Err(AllocError::NotFound(_))));
    }

    #[test]
    fn test_concurrent_updates_are_not_lost() {
        let store = Arc::new(VariantStore::new());
        store.register("A").unwrap();

        thread::scope(|s| {
            for _ in 0..100 {
                let store = &store;
                s.spawn(move || {
                    store.update("A", 1.0, 1.0, None).unwrap();
                });
            }
        });

        let stats = store.stats("A").unwrap();
        assert_eq!(stats.alpha, 101.0);
        assert_eq!(stats.beta, 1.0);
        assert_eq!(stats.spend, 100.0);
    }

    #[test]
    fn test_concurrent_lazy_registration_creates_one_variant() {
        let store = VariantStore::new();
        thread::scope(|s| {
            for _ in 0..16 {
                s.spawn(|| store.update("new", 1.0, 0.0, None).unwrap());
            }
        });
        assert_eq!(store.len(), 1);
        assert_eq!(store.stats("new").unwrap().alpha, 17.0);
    }

    #[test]
    fn test_archive_marks_variant() {
        let store = VariantStore::new();
        store.register("A").unwrap();
        assert!(store.archive("A").unwrap().archived);
        assert!(store.stats("A").unwrap().archived);
        assert!(matches!(store.archive("B"), Err(AllocError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_committed_rows_are_queued_for_persistence() {
        use crate::persistence::{
            InMemorySnapshotStore, PersistenceWriter, RetryPolicy, SnapshotStore,
        };
        use tokio_util::sync::CancellationToken;

        let snapshots = Arc::new(InMemorySnapshotStore::new());
        let shutdown = CancellationToken::new();
        let (handle, task) = PersistenceWriter::new(
            Some(snapshots.clone()),
            None,
            RetryPolicy::default(),
        )
        .spawn(shutdown.clone());
        let store = VariantStore::with_persistence(handle.clone());

        store.register("A").unwrap();
        store.update("B", 1.0, 2.0, None).unwrap();
        store.archive("A").unwrap();
        handle.flush().await;

        let mut rows = snapshots.load_variants().await.unwrap();
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(rows.len(), 2);
        assert!(rows[0].archived);
        assert_eq!(rows[1].alpha, 2.0);

        shutdown.cancel();
        task.unwrap().await.unwrap();
    }

    #[test]
    fn test_restore_clamps_and_keeps_existing() {
        let store = VariantStore::new();
        store.update("A", 1.0, 0.0, None).unwrap();

        let mut a = Variant::new(VariantId::new("A").unwrap());
        a.alpha = 50.0;
        let mut b = Variant::new(VariantId::new("B").unwrap());
        b.alpha = 0.2;

        assert_eq!(store.restore(vec![a, b]), 1);
        assert_eq!(store.stats("A").unwrap().alpha, 2.0);
        assert_eq!(store.stats("B").unwrap().alpha, 1.0);
        assert_eq!(store.ids().len(), 2);
    }
}
