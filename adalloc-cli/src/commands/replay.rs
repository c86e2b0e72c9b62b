use std::path::{Path, PathBuf};

use adalloc_engine::persistence::{EventLog, JsonlEventLog};
use adalloc_engine::{EngineConfig, InstantLearner, OnlineModelState, ReplaySummary};
use anyhow::{Context, Result};
use clap::Args;
use tracing::debug;

#[derive(Args)]
pub struct ReplayArgs {
    /// JSON-lines learning event log
    pub log: PathBuf,

    /// Print the final model as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn run(args: ReplayArgs, config_path: Option<&Path>) -> Result<()> {
    let config = EngineConfig::load_or_default(config_path)?;
    let log = JsonlEventLog::new(&args.log);
    let events = log
        .read_all()
        .await
        .with_context(|| format!("reading {}", args.log.display()))?;
    debug!(events = events.len(), path = %args.log.display(), "Loaded event log");

    let (summary, state) = replay(&config, events);
    if args.json {
        println!("{}", serde_json::to_string_pretty(&state)?);
        return Ok(());
    }

    println!("Events applied:  {}", summary.events_applied);
    println!("Events rejected: {}", summary.events_rejected);
    println!("Drift events:    {}", summary.drift_events);
    println!("Mean loss:       {:.6}", summary.mean_loss);
    println!("Learning rate:   {:.6}", state.learning_rate);
    println!("Bias:            {:.6}", state.bias);
    for (feature, weight) in &state.weights {
        println!("  {feature:<16} {weight:.6}");
    }
    Ok(())
}

fn replay(
    config: &EngineConfig,
    events: Vec<adalloc_engine::LearningEvent>,
) -> (ReplaySummary, OnlineModelState) {
    let mut learner = InstantLearner::new(&config.learner, &config.drift);
    let summary = learner.replay(events);
    (summary, learner.state())
}
