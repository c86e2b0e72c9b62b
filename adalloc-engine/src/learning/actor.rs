//! Single-writer queue in front of the [`InstantLearner`]
//!
//! Gradient steps are not associative, so every request goes through one
//! bounded mpsc queue drained by exactly one task that owns the learner.
//! Callers hold cheap [`LearnerHandle`] clones and await a oneshot reply.

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{AllocError, Result};
use crate::persistence::PersistenceHandle;
use crate::types::{FeatureVector, LearningEvent};

use super::learner::{InstantLearner, LearnOutcome, OnlineModelState};

enum LearnerCommand {
    Learn {
        event: LearningEvent,
        reply: oneshot::Sender<Result<LearnOutcome>>,
    },
    Predict {
        features: FeatureVector,
        reply: oneshot::Sender<Result<f64>>,
    },
    Snapshot {
        reply: oneshot::Sender<OnlineModelState>,
    },
}

/// Cloneable handle to the learner task
#[derive(Clone, Debug)]
pub struct LearnerHandle {
    tx: mpsc::Sender<LearnerCommand>,
}

impl LearnerHandle {
    /// Spawn the learner task.
    ///
    /// Accepted events are forwarded to `audit` after the step commits. The
    /// task stops when `shutdown` fires or every handle is dropped, and
    /// hands back the learner.
    pub fn spawn(
        learner: InstantLearner,
        capacity: usize,
        audit: PersistenceHandle,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<InstantLearner>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let task = tokio::spawn(run(learner, rx, audit, shutdown));
        (Self { tx }, task)
    }

    /// Queue an event and wait for its learn step
    pub async fn learn(&self, event: LearningEvent) -> Result<LearnOutcome> {
        // Reject before queueing so a bad event never reaches the writer
        event.validate()?;
        let (reply, rx) = oneshot::channel();
        self.send(LearnerCommand::Learn { event, reply }).await?;
        rx.await.map_err(|_| stopped())?
    }

    pub async fn predict(&self, features: FeatureVector) -> Result<f64> {
        let (reply, rx) = oneshot::channel();
        self.send(LearnerCommand::Predict { features, reply })
            .await?;
        rx.await.map_err(|_| stopped())?
    }

    pub async fn state(&self) -> Result<OnlineModelState> {
        let (reply, rx) = oneshot::channel();
        self.send(LearnerCommand::Snapshot { reply }).await?;
        rx.await.map_err(|_| stopped())
    }

    async fn send(&self, command: LearnerCommand) -> Result<()> {
        self.tx.send(command).await.map_err(|_| stopped())
    }
}

fn stopped() -> AllocError {
    AllocError::Shutdown("learner task has stopped".into())
}

async fn run(
    mut learner: InstantLearner,
    mut rx: mpsc::Receiver<LearnerCommand>,
    audit: PersistenceHandle,
    shutdown: CancellationToken,
) -> InstantLearner {
    info!("Learner task starting");
    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                info!("Learner task received shutdown signal");
                break;
            }

            command = rx.recv() => {
                let Some(command) = command else {
                    debug!("All learner handles dropped");
                    break;
                };
                match command {
                    LearnerCommand::Learn { event, reply } => {
                        let result = learner.learn_from_event(&event);
                        if result.is_ok() {
                            audit.record_event(event);
                        }
                        let _ = reply.send(result);
                    }
                    LearnerCommand::Predict { features, reply } => {
                        let _ = reply.send(learner.predict(&features));
                    }
                    LearnerCommand::Snapshot { reply } => {
                        let _ = reply.send(learner.state());
                    }
                }
            }
        }
    }
    learner
}
