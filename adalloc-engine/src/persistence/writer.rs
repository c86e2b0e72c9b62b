//! Write-behind persistence
//!
//! In-memory mutations commit first; the committed rows are then handed to a
//! background writer through an unbounded channel. Producers send while still
//! holding the lock that guarded the commit, so rows for one key arrive in
//! commit order and the last one received is the newest. The writer drains
//! whatever is queued, coalesces variant and registry rows by key, and
//! writes each batch with bounded retry. A crash between commit and flush
//! loses at most the queued batch.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::evaluation::ModelRegistryEntry;
use crate::types::{LearningEvent, Variant, VariantId};

use super::event_log::EventLog;
use super::retry::{RetryPolicy, retry_with_backoff};
use super::store::SnapshotStore;

enum PersistCommand {
    Variant(Variant),
    Registry(Vec<ModelRegistryEntry>),
    Event(LearningEvent),
    Flush(oneshot::Sender<()>),
}

/// Non-blocking sender side of the writer.
///
/// A disabled handle drops everything, which keeps the in-memory engine
/// usable without any storage.
#[derive(Clone, Debug, Default)]
pub struct PersistenceHandle {
    tx: Option<mpsc::UnboundedSender<PersistCommand>>,
}

impl PersistenceHandle {
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    pub fn record_variant(&self, variant: Variant) {
        self.send(PersistCommand::Variant(variant));
    }

    pub fn record_registry(&self, entries: Vec<ModelRegistryEntry>) {
        if !entries.is_empty() {
            self.send(PersistCommand::Registry(entries));
        }
    }

    pub fn record_event(&self, event: LearningEvent) {
        self.send(PersistCommand::Event(event));
    }

    /// Wait until everything queued before this call has been written
    pub async fn flush(&self) {
        let Some(tx) = &self.tx else { return };
        let (done, rx) = oneshot::channel();
        if tx.send(PersistCommand::Flush(done)).is_ok() {
            let _ = rx.await;
        }
    }

    fn send(&self, command: PersistCommand) {
        if let Some(tx) = &self.tx
            && tx.send(command).is_err()
        {
            debug!("Persistence writer stopped, dropping write");
        }
    }
}

/// Counters reported when the writer stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    pub batches_written: u64,
    pub write_failures: u64,
}

#[derive(Default)]
struct Batch {
    variants: HashMap<VariantId, Variant>,
    registry: HashMap<(String, String), ModelRegistryEntry>,
    events: Vec<LearningEvent>,
    waiters: Vec<oneshot::Sender<()>>,
}

impl Batch {
    fn add(&mut self, command: PersistCommand) {
        match command {
            PersistCommand::Variant(variant) => {
                self.variants.insert(variant.id.clone(), variant);
            }
            PersistCommand::Registry(entries) => {
                for entry in entries {
                    self.registry.insert(entry.key(), entry);
                }
            }
            PersistCommand::Event(event) => self.events.push(event),
            PersistCommand::Flush(done) => self.waiters.push(done),
        }
    }

    fn has_writes(&self) -> bool {
        !(self.variants.is_empty() && self.registry.is_empty() && self.events.is_empty())
    }
}

/// Background task that owns the storage backends
pub struct PersistenceWriter {
    store: Option<Arc<dyn SnapshotStore>>,
    event_log: Option<Arc<dyn EventLog>>,
    retry: RetryPolicy,
}

impl PersistenceWriter {
    pub fn new(
        store: Option<Arc<dyn SnapshotStore>>,
        event_log: Option<Arc<dyn EventLog>>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            event_log,
            retry,
        }
    }

    /// Spawn the writer.
    ///
    /// With neither a store nor a log configured no task is started and the
    /// returned handle is disabled.
    pub fn spawn(
        self,
        shutdown: CancellationToken,
    ) -> (PersistenceHandle, Option<JoinHandle<WriterStats>>) {
        if self.store.is_none() && self.event_log.is_none() {
            return (PersistenceHandle::disabled(), None);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(self.run(rx, shutdown));
        (PersistenceHandle { tx: Some(tx) }, Some(task))
    }

    async fn run(
        self,
        mut rx: mpsc::UnboundedReceiver<PersistCommand>,
        shutdown: CancellationToken,
    ) -> WriterStats {
        info!("Persistence writer starting");
        let mut stats = WriterStats::default();
        loop {
            let first = tokio::select! {
                biased;

                _ = shutdown.cancelled() => None,
                command = rx.recv() => command,
            };
            let Some(first) = first else { break };

            let mut batch = Batch::default();
            batch.add(first);
            while let Ok(command) = rx.try_recv() {
                batch.add(command);
            }
            self.write_batch(batch, &mut stats).await;
        }

        // Flush what was committed before shutdown
        rx.close();
        let mut batch = Batch::default();
        while let Ok(command) = rx.try_recv() {
            batch.add(command);
        }
        self.write_batch(batch, &mut stats).await;

        info!(
            batches = stats.batches_written,
            failures = stats.write_failures,
            "Persistence writer stopped"
        );
        stats
    }

    async fn write_batch(&self, batch: Batch, stats: &mut WriterStats) {
        if batch.has_writes() {
            let mut failed = false;

            if let Some(store) = &self.store {
                if !batch.variants.is_empty() {
                    let rows: Vec<_> = batch.variants.into_values().collect();
                    let result =
                        retry_with_backoff(self.retry, "save_variants", || store.save_variants(&rows))
                            .await;
                    if let Err(e) = result {
                        error!(error = %e, rows = rows.len(), "Failed to persist variants");
                        failed = true;
                    }
                }
                if !batch.registry.is_empty() {
                    let rows: Vec<_> = batch.registry.into_values().collect();
                    let result =
                        retry_with_backoff(self.retry, "save_registry", || store.save_registry(&rows))
                            .await;
                    if let Err(e) = result {
                        error!(error = %e, rows = rows.len(), "Failed to persist registry");
                        failed = true;
                    }
                }
            }

            if let Some(log) = &self.event_log
                && !batch.events.is_empty()
            {
                let result =
                    retry_with_backoff(self.retry, "append_events", || log.append(&batch.events))
                        .await;
                if let Err(e) = result {
                    error!(error = %e, events = batch.events.len(), "Failed to append events");
                    failed = true;
                }
            }

            if failed {
                stats.write_failures += 1;
            } else {
                stats.batches_written += 1;
            }
        }

        for waiter in batch.waiters {
            let _ = waiter.send(());
        }
    }
}
