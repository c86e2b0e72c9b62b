use std::path::{Path, PathBuf};
use std::sync::Arc;

use adalloc_engine::{
    AllocationEngine, EngineConfig, JsonArtifactLoader, JsonFileStore, ModelPromotion,
    PromotionDecision, TestSet,
};
use anyhow::{Context, Result};
use clap::Args;

#[derive(Args)]
pub struct EvaluateArgs {
    /// Model family the artifacts belong to
    #[arg(long)]
    pub family: String,

    /// Artifact the challenger is measured against
    #[arg(long)]
    pub champion: String,

    /// Artifact proposed as the new champion
    #[arg(long)]
    pub challenger: String,

    /// JSON test set with `features`, `revenue` and `spend` columns
    #[arg(long)]
    pub test_set: PathBuf,

    /// Print the result as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn run(args: EvaluateArgs, config_path: Option<&Path>) -> Result<()> {
    let mut config = EngineConfig::load_or_default(config_path)?;
    // One-shot command: no background cycles
    config.decay.enabled = false;
    config.evaluator.enabled = false;

    let test_set = TestSet::load(&args.test_set)
        .await
        .with_context(|| format!("loading test set {}", args.test_set.display()))?;

    let data_dir = config.storage.data_dir.clone();
    let engine = AllocationEngine::builder(config)
        .snapshot_store(Arc::new(JsonFileStore::new(&data_dir)))
        .artifact_loader(Arc::new(JsonArtifactLoader::new()))
        .start()
        .await?;

    let result = engine
        .evaluate(&args.family, &args.champion, &args.challenger, &test_set)
        .await;
    engine.shutdown().await?;
    let result = result?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_result(&result);
    }
    Ok(())
}

fn print_result(result: &ModelPromotion) {
    println!("Family:          {}", result.model_family);
    println!(
        "Champion ROAS:   {:.4}  ({})",
        result.champion_roas, result.champion_artifact
    );
    println!(
        "Challenger ROAS: {:.4}  ({})",
        result.challenger_roas, result.challenger_artifact
    );
    match result.improvement_pct {
        Some(pct) => println!("Improvement:     {pct:+.2}%"),
        None => println!("Improvement:     n/a (champion ROAS is zero)"),
    }
    let decision = match result.decision {
        PromotionDecision::Promoted => "promoted",
        PromotionDecision::Retained => "champion retained",
        PromotionDecision::Conflict => "conflict, champion changed concurrently",
    };
    println!("Decision:        {decision}");
}
