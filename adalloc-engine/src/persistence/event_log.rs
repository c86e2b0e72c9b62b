//! Append-only learning event log for audit and replay.
//!
//! Provides a trait-based interface so the engine does not care whether
//! events land in a local JSON-lines file or somewhere else.

use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::{AllocError, Result};
use crate::types::LearningEvent;

use super::store::storage_error;

/// Trait for learning event log storage.
///
/// Implementations must be append-only: events are never rewritten or
/// reordered once appended.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Append events in order
    async fn append(&self, events: &[LearningEvent]) -> Result<()>;

    /// Read every event, oldest first
    async fn read_all(&self) -> Result<Vec<LearningEvent>>;
}

/// In-memory implementation for testing.
#[derive(Debug, Default)]
pub struct InMemoryEventLog {
    events: RwLock<Vec<LearningEvent>>,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get count of stored events (for testing)
    pub fn len(&self) -> usize {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Check if log is empty (for testing)
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn append(&self, events: &[LearningEvent]) -> Result<()> {
        self.events
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(events);
        Ok(())
    }

    async fn read_all(&self) -> Result<Vec<LearningEvent>> {
        let events = self.events.read().unwrap_or_else(PoisonError::into_inner);
        Ok(events.clone())
    }
}

/// One JSON object per line
#[derive(Debug)]
pub struct JsonlEventLog {
    path: PathBuf,
    append_lock: Mutex<()>,
}

impl JsonlEventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            append_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parse log text, reporting the first malformed line
    pub fn parse(contents: &str) -> Result<Vec<LearningEvent>> {
        contents
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(idx, line)| {
                serde_json::from_str(line).map_err(|e| {
                    AllocError::Serialization(format!("line {}: {e}", idx + 1))
                })
            })
            .collect()
    }
}

#[async_trait]
impl EventLog for JsonlEventLog {
    async fn append(&self, events: &[LearningEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::new();
        for event in events {
            serde_json::to_writer(&mut buf, event)?;
            buf.push(b'\n');
        }

        let _guard = self.append_lock.lock().await;
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(storage_error)?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(storage_error)?;
        file.write_all(&buf).await.map_err(storage_error)?;
        file.flush().await.map_err(storage_error)?;
        Ok(())
    }

    async fn read_all(&self) -> Result<Vec<LearningEvent>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => Self::parse(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(storage_error(e)),
        }
    }
}
