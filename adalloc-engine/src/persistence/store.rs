//! Snapshot storage for variants and registry rows
//!
//! Rows are upserted: one row per variant keyed by id, one row per registry
//! entry keyed by `(model_family, artifact_path)`.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;

use crate::error::{AllocError, Result};
use crate::evaluation::ModelRegistryEntry;
use crate::types::{Variant, VariantId};

/// File holding the variant rows
pub const VARIANTS_FILE: &str = "variants.json";

/// File holding the registry rows
pub const REGISTRY_FILE: &str = "registry.json";

/// Storage interface for engine snapshots
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    // Variants
    async fn load_variants(&self) -> Result<Vec<Variant>>;
    async fn save_variants(&self, variants: &[Variant]) -> Result<()>;

    // Registry
    async fn load_registry(&self) -> Result<Vec<ModelRegistryEntry>>;
    async fn save_registry(&self, entries: &[ModelRegistryEntry]) -> Result<()>;
}

/// Map an IO failure onto the transient/permanent split
pub(crate) fn storage_error(err: std::io::Error) -> AllocError {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut => {
            AllocError::TransientStorage(err.to_string())
        }
        _ => AllocError::Storage(err.to_string()),
    }
}

/// In-memory implementation for testing.
#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    variants: RwLock<HashMap<VariantId, Variant>>,
    registry: RwLock<HashMap<(String, String), ModelRegistryEntry>>,
    failures_remaining: AtomicU32,
    writes: AtomicU32,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` writes fail with a transient error (for testing)
    pub fn fail_next_writes(&self, count: u32) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    /// Number of successful writes (for testing)
    pub fn write_count(&self) -> u32 {
        self.writes.load(Ordering::SeqCst)
    }

    fn check_write(&self) -> Result<()> {
        let injected = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(AllocError::TransientStorage("injected failure".into()));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn load_variants(&self) -> Result<Vec<Variant>> {
        let variants = self.variants.read().unwrap_or_else(PoisonError::into_inner);
        Ok(variants.values().cloned().collect())
    }

    async fn save_variants(&self, variants: &[Variant]) -> Result<()> {
        self.check_write()?;
        let mut rows = self.variants.write().unwrap_or_else(PoisonError::into_inner);
        for variant in variants {
            rows.insert(variant.id.clone(), variant.clone());
        }
        Ok(())
    }

    async fn load_registry(&self) -> Result<Vec<ModelRegistryEntry>> {
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        Ok(registry.values().cloned().collect())
    }

    async fn save_registry(&self, entries: &[ModelRegistryEntry]) -> Result<()> {
        self.check_write()?;
        let mut rows = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        for entry in entries {
            rows.insert(entry.key(), entry.clone());
        }
        Ok(())
    }
}

/// JSON files under a data directory, replaced atomically on every write
#[derive(Debug)]
pub struct JsonFileStore {
    dir: PathBuf,
    // Serializes read-merge-write cycles
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn read_rows<T>(&self, file: &str) -> Result<T>
    where
        T: DeserializeOwned + Default,
    {
        let path = self.dir.join(file);
        match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                AllocError::Serialization(format!("{}: {e}", path.display()))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
            Err(e) => Err(storage_error(e)),
        }
    }

    async fn write_rows<T: Serialize>(&self, file: &str, rows: &T) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(storage_error)?;
        let path = self.dir.join(file);
        let tmp = self.dir.join(format!("{file}.tmp"));
        let bytes = serde_json::to_vec_pretty(rows)?;
        tokio::fs::write(&tmp, bytes).await.map_err(storage_error)?;
        tokio::fs::rename(&tmp, &path).await.map_err(storage_error)?;
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for JsonFileStore {
    async fn load_variants(&self) -> Result<Vec<Variant>> {
        let rows: BTreeMap<String, Variant> = self.read_rows(VARIANTS_FILE).await?;
        Ok(rows.into_values().collect())
    }

    async fn save_variants(&self, variants: &[Variant]) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut rows: BTreeMap<String, Variant> = self.read_rows(VARIANTS_FILE).await?;
        for variant in variants {
            rows.insert(variant.id.to_string(), variant.clone());
        }
        self.write_rows(VARIANTS_FILE, &rows).await
    }

    async fn load_registry(&self) -> Result<Vec<ModelRegistryEntry>> {
        self.read_rows(REGISTRY_FILE).await
    }

    async fn save_registry(&self, entries: &[ModelRegistryEntry]) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let existing: Vec<ModelRegistryEntry> = self.read_rows(REGISTRY_FILE).await?;
        let mut rows: BTreeMap<(String, String), ModelRegistryEntry> =
            existing.into_iter().map(|e| (e.key(), e)).collect();
        for entry in entries {
            rows.insert(entry.key(), entry.clone());
        }
        let rows: Vec<_> = rows.into_values().collect();
        self.write_rows(REGISTRY_FILE, &rows).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluation::ModelStage;

    fn variant(id: &str, alpha: f64) -> Variant {
        let mut v = Variant::new(VariantId::new(id).unwrap());
        v.alpha = alpha;
        v
    }

    #[tokio::test]
    async fn test_in_memory_upserts_by_id() {
        let store = InMemorySnapshotStore::new();
        store.save_variants(&[variant("A", 2.0)]).await.unwrap();
        store
            .save_variants(&[variant("A", 5.0), variant("B", 1.0)])
            .await
            .unwrap();
        let mut rows = store.load_variants().await.unwrap();
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].alpha, 5.0);
        assert_eq!(store.write_count(), 2);
    }

    #[tokio::test]
    async fn test_in_memory_injected_failures_are_transient() {
        let store = InMemorySnapshotStore::new();
        store.fail_next_writes(1);
        let err = store.save_variants(&[variant("A", 2.0)]).await.unwrap_err();
        assert!(err.is_transient());
        store.save_variants(&[variant("A", 2.0)]).await.unwrap();
        assert_eq!(store.load_variants().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_file_store_missing_files_load_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("nested"));
        assert!(store.load_variants().await.unwrap().is_empty());
        assert!(store.load_registry().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_store_roundtrip_and_upsert() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        store.save_variants(&[variant("A", 3.0)]).await.unwrap();
        store
            .save_variants(&[variant("B", 4.0), variant("A", 6.0)])
            .await
            .unwrap();

        let reopened = JsonFileStore::new(dir.path());
        let rows = reopened.load_variants().await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id.as_str(), "A");
        assert_eq!(rows[0].alpha, 6.0);
        assert!(!dir.path().join("variants.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_file_store_registry_keyed_by_family_and_path() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        let mut entry = ModelRegistryEntry::new("roas", "models/v1.json");
        store.save_registry(&[entry.clone()]).await.unwrap();
        entry.stage = ModelStage::Challenger;
        let other = ModelRegistryEntry::new("ctr", "models/v1.json");
        store.save_registry(&[entry, other]).await.unwrap();

        let rows = store.load_registry().await.unwrap();
        assert_eq!(rows.len(), 2);
        let roas = rows.iter().find(|e| e.model_family == "roas").unwrap();
        assert_eq!(roas.stage, ModelStage::Challenger);
    }

    #[tokio::test]
    async fn test_file_store_corrupt_file_is_serialization_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(VARIANTS_FILE), "{not json").unwrap();
        let store = JsonFileStore::new(dir.path());
        assert!(matches!(
            store.load_variants().await,
            Err(AllocError::Serialization(_))
        ));
    }
}
