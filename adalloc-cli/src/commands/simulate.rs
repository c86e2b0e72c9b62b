use std::path::Path;

use adalloc_engine::{AllocationEngine, EngineConfig, OutcomeMetrics, VariantStats};
use anyhow::{Result, bail};
use clap::Args;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;

#[derive(Args)]
pub struct SimulateArgs {
    /// Number of simulated variants
    #[arg(long, default_value_t = 3)]
    pub variants: usize,

    /// Number of allocation rounds
    #[arg(long, default_value_t = 1000)]
    pub rounds: usize,

    /// RNG seed for a reproducible run
    #[arg(long)]
    pub seed: Option<u64>,
}

/// Value of one conversion in simulated revenue
const CONVERSION_VALUE: f64 = 3.0;

struct SimulatedVariant {
    id: String,
    conversion_rate: f64,
    allocations: usize,
}

struct SimulationReport {
    variants: Vec<(SimulatedVariant, VariantStats)>,
    rounds: usize,
}

pub async fn run(args: SimulateArgs, config_path: Option<&Path>) -> Result<()> {
    if args.variants == 0 || args.rounds == 0 {
        bail!("--variants and --rounds must be > 0");
    }
    let mut config = EngineConfig::load_or_default(config_path)?;
    config.decay.enabled = false;
    config.evaluator.enabled = false;

    let mut rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let rates: Vec<f64> = (0..args.variants)
        .map(|_| rng.gen_range(0.01..0.3))
        .collect();
    info!(variants = rates.len(), rounds = args.rounds, seed = args.seed, "Starting simulation");
    let engine = AllocationEngine::in_memory(config).await?;
    let report = simulate(&engine, &rates, args.rounds, &mut rng);
    engine.shutdown().await?;
    let report = report?;

    println!(
        "{:<8} {:>10} {:>10} {:>8} {:>10} {:>10}",
        "variant", "true_rate", "share", "roas", "alpha", "beta"
    );
    for (variant, stats) in &report.variants {
        let share = variant.allocations as f64 / report.rounds as f64;
        println!(
            "{:<8} {:>10.4} {:>9.1}% {:>8.3} {:>10.1} {:>10.1}",
            variant.id,
            variant.conversion_rate,
            share * 100.0,
            stats.roas,
            stats.alpha,
            stats.beta
        );
    }
    Ok(())
}

/// Allocate `rounds` impressions across variants converting at `rates`
fn simulate<R: Rng>(
    engine: &AllocationEngine,
    rates: &[f64],
    rounds: usize,
    rng: &mut R,
) -> Result<SimulationReport> {
    let mut variants: Vec<SimulatedVariant> = rates
        .iter()
        .enumerate()
        .map(|(i, rate)| SimulatedVariant {
            id: format!("v{i}"),
            conversion_rate: *rate,
            allocations: 0,
        })
        .collect();
    for variant in &variants {
        engine.register_variant(&variant.id)?;
    }

    for _ in 0..rounds {
        let decision = engine.select_variant_with_rng(None, rng)?;
        let Some(variant) = variants
            .iter_mut()
            .find(|v| v.id == decision.variant_id.as_str())
        else {
            bail!("engine selected unknown variant {}", decision.variant_id);
        };
        variant.allocations += 1;

        let converted = rng.gen_bool(variant.conversion_rate);
        let reward = if converted { 1.0 } else { 0.0 };
        let metrics = OutcomeMetrics {
            impressions: 1,
            clicks: 1,
            conversions: u64::from(converted),
            revenue: reward * CONVERSION_VALUE,
        };
        engine.update_variant(&variant.id, reward, 1.0, Some(&metrics))?;
    }

    let variants = variants
        .into_iter()
        .map(|v| {
            let stats = engine.get_variant_stats(&v.id)?;
            Ok((v, stats))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(SimulationReport { variants, rounds })
}
