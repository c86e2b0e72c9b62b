//! Model artifact lifecycle
//!
//! ```text
//! candidate -> challenger -> champion -> archived
//!                    \-> archived
//! ```
//!
//! At most one champion exists per model family. Promotion is a single
//! compare-and-swap under the registry lock: the caller names the champion it
//! measured against, and the swap only happens if that is still the champion.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{AllocError, Result};
use crate::persistence::PersistenceHandle;

/// Lifecycle stage of a registered artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelStage {
    Candidate,
    Challenger,
    Champion,
    Archived,
}

impl ModelStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Candidate => "candidate",
            Self::Challenger => "challenger",
            Self::Champion => "champion",
            Self::Archived => "archived",
        }
    }

    /// Whether `self -> next` is an allowed lifecycle step
    pub fn can_transition_to(&self, next: ModelStage) -> bool {
        matches!(
            (self, next),
            (Self::Candidate, Self::Challenger)
                | (Self::Challenger, Self::Champion)
                | (Self::Challenger, Self::Archived)
                | (Self::Champion, Self::Archived)
        )
    }
}

impl fmt::Display for ModelStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRegistryEntry {
    pub model_family: String,
    pub artifact_path: String,
    pub stage: ModelStage,
    pub registered_at: DateTime<Utc>,
    #[serde(default)]
    pub promoted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub archived_at: Option<DateTime<Utc>>,
}

impl ModelRegistryEntry {
    pub fn new(model_family: impl Into<String>, artifact_path: impl Into<String>) -> Self {
        Self {
            model_family: model_family.into(),
            artifact_path: artifact_path.into(),
            stage: ModelStage::Candidate,
            registered_at: Utc::now(),
            promoted_at: None,
            archived_at: None,
        }
    }

    /// Storage key
    pub fn key(&self) -> (String, String) {
        (self.model_family.clone(), self.artifact_path.clone())
    }

    fn transition(&mut self, next: ModelStage, now: DateTime<Utc>) -> Result<()> {
        if !self.stage.can_transition_to(next) {
            return Err(AllocError::InvalidTransition {
                artifact: format!("{}/{}", self.model_family, self.artifact_path),
                from: self.stage.to_string(),
                to: next.to_string(),
            });
        }
        self.stage = next;
        match next {
            ModelStage::Champion => self.promoted_at = Some(now),
            ModelStage::Archived => self.archived_at = Some(now),
            _ => {}
        }
        Ok(())
    }
}

/// Result of a compare-and-swap promotion
#[derive(Debug, Clone, PartialEq)]
pub enum PromoteOutcome {
    Promoted {
        champion: ModelRegistryEntry,
        archived: Option<ModelRegistryEntry>,
    },
    /// The champion changed since the caller read it; nothing was modified
    Conflict { current: Option<String> },
}

type Key = (String, String);

/// In-memory registry, mirrored to storage through the write-behind handle
#[derive(Debug, Default)]
pub struct ModelRegistry {
    entries: Mutex<BTreeMap<Key, ModelRegistryEntry>>,
    persistence: PersistenceHandle,
}

impl ModelRegistry {
    pub fn new(persistence: PersistenceHandle) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            persistence,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<Key, ModelRegistryEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn key(family: &str, path: &str) -> Key {
        (family.to_string(), path.to_string())
    }

    fn validate_names(family: &str, path: &str) -> Result<()> {
        if family.trim().is_empty() || path.trim().is_empty() {
            return Err(AllocError::Validation(
                "model family and artifact path must be non-empty".into(),
            ));
        }
        Ok(())
    }

    /// Load persisted rows.
    ///
    /// Rows already present are kept. If the persisted rows carry more than
    /// one champion for a family, only the most recently promoted one keeps
    /// the stage and the rest are archived.
    pub fn restore(&self, rows: impl IntoIterator<Item = ModelRegistryEntry>) -> usize {
        let mut entries = self.lock();
        let mut restored = 0;
        for row in rows {
            if let std::collections::btree_map::Entry::Vacant(slot) = entries.entry(row.key()) {
                slot.insert(row);
                restored += 1;
            }
        }

        let mut best: BTreeMap<String, (Option<DateTime<Utc>>, Key)> = BTreeMap::new();
        for (key, entry) in entries.iter() {
            if entry.stage != ModelStage::Champion {
                continue;
            }
            match best.get(&entry.model_family) {
                Some((promoted_at, _)) if *promoted_at >= entry.promoted_at => {}
                _ => {
                    best.insert(entry.model_family.clone(), (entry.promoted_at, key.clone()));
                }
            }
        }
        let now = Utc::now();
        for (key, entry) in entries.iter_mut() {
            if entry.stage == ModelStage::Champion
                && best.get(&entry.model_family).map(|(_, k)| k) != Some(key)
            {
                warn!(
                    family = %entry.model_family,
                    artifact = %entry.artifact_path,
                    "Archiving duplicate champion found in storage"
                );
                entry.stage = ModelStage::Archived;
                entry.archived_at = Some(now);
            }
        }
        restored
    }

    /// Register an artifact as a candidate; an existing row is returned as is
    pub fn register_candidate(&self, family: &str, path: &str) -> Result<ModelRegistryEntry> {
        Self::validate_names(family, path)?;
        let mut entries = self.lock();
        if let Some(existing) = entries.get(&Self::key(family, path)) {
            return Ok(existing.clone());
        }
        let entry = ModelRegistryEntry::new(family, path);
        entries.insert(entry.key(), entry.clone());
        self.persistence.record_registry(vec![entry.clone()]);
        drop(entries);

        info!(family, artifact = path, "Registered candidate model");
        Ok(entry)
    }

    pub fn mark_challenger(&self, family: &str, path: &str) -> Result<ModelRegistryEntry> {
        self.step(family, path, ModelStage::Challenger)
    }

    /// Retire a challenger that lost
    pub fn reject(&self, family: &str, path: &str) -> Result<ModelRegistryEntry> {
        self.step(family, path, ModelStage::Archived)
    }

    fn step(&self, family: &str, path: &str, next: ModelStage) -> Result<ModelRegistryEntry> {
        let mut entries = self.lock();
        let entry = entries
            .get_mut(&Self::key(family, path))
            .ok_or_else(|| AllocError::NotFound(format!("model {family}/{path}")))?;
        entry.transition(next, Utc::now())?;
        let entry = entry.clone();
        self.persistence.record_registry(vec![entry.clone()]);
        Ok(entry)
    }

    pub fn champion(&self, family: &str) -> Option<ModelRegistryEntry> {
        self.lock()
            .values()
            .find(|e| e.model_family == family && e.stage == ModelStage::Champion)
            .cloned()
    }

    pub fn get(&self, family: &str, path: &str) -> Option<ModelRegistryEntry> {
        self.lock().get(&Self::key(family, path)).cloned()
    }

    pub fn entries(&self, family: &str) -> Vec<ModelRegistryEntry> {
        self.lock()
            .values()
            .filter(|e| e.model_family == family)
            .cloned()
            .collect()
    }

    pub fn all_entries(&self) -> Vec<ModelRegistryEntry> {
        self.lock().values().cloned().collect()
    }

    /// Make `path` the champion of `family` if the champion is still
    /// `expected_champion`.
    ///
    /// The promoted row may be absent (it is registered here), a candidate
    /// or a challenger. The old champion is archived in the same critical
    /// section, so no reader ever sees two champions.
    pub fn promote(
        &self,
        family: &str,
        path: &str,
        expected_champion: Option<&str>,
    ) -> Result<PromoteOutcome> {
        Self::validate_names(family, path)?;
        let now = Utc::now();
        let mut entries = self.lock();

        let current = entries
            .values()
            .find(|e| e.model_family == family && e.stage == ModelStage::Champion)
            .map(|e| e.artifact_path.clone());
        if current.as_deref() != expected_champion {
            return Ok(PromoteOutcome::Conflict { current });
        }

        // Validate the whole transaction before touching any row
        let key = Self::key(family, path);
        let mut champion = entries
            .get(&key)
            .cloned()
            .unwrap_or_else(|| ModelRegistryEntry::new(family, path));
        if champion.stage == ModelStage::Candidate {
            champion.transition(ModelStage::Challenger, now)?;
        }
        champion.transition(ModelStage::Champion, now)?;

        let archived = match current {
            Some(old_path) => {
                let old_key = Self::key(family, &old_path);
                let mut old = entries
                    .get(&old_key)
                    .cloned()
                    .ok_or_else(|| AllocError::NotFound(format!("model {family}/{old_path}")))?;
                old.transition(ModelStage::Archived, now)?;
                entries.insert(old_key, old.clone());
                Some(old)
            }
            None => None,
        };
        entries.insert(key, champion.clone());
        // Queued before unlocking so rows reach the writer in commit order
        let mut changed = vec![champion.clone()];
        changed.extend(archived.clone());
        self.persistence.record_registry(changed);
        drop(entries);

        info!(
            family,
            champion = path,
            archived = archived.as_ref().map(|e| e.artifact_path.as_str()),
            "Promoted model"
        );

        Ok(PromoteOutcome::Promoted { champion, archived })
    }
}
