use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(name = "adalloc", about = "Adaptive budget allocation across ad variants")]
#[command(version, propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (defaults to <config dir>/adalloc/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect configuration
    Config(commands::config::ConfigArgs),
    /// Replay a learning event log through a fresh learner
    Replay(commands::replay::ReplayArgs),
    /// Compare a challenger model against the champion
    Evaluate(commands::evaluate::EvaluateArgs),
    /// Run a synthetic allocation against simulated variants
    Simulate(commands::simulate::SimulateArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = cli.config.as_deref();
    match cli.command {
        Commands::Config(args) => commands::config::run(args, config),
        Commands::Replay(args) => commands::replay::run(args, config).await,
        Commands::Evaluate(args) => commands::evaluate::run(args, config).await,
        Commands::Simulate(args) => commands::simulate::run(args, config).await,
    }
}
