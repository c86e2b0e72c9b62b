use std::path::Path;

use adalloc_engine::EngineConfig;
use anyhow::Result;
use clap::{Args, Subcommand};

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Show configuration and data paths
    Path,
}

pub fn run(args: ConfigArgs, config_path: Option<&Path>) -> Result<()> {
    match args.command {
        ConfigCommands::Show => show_config(config_path),
        ConfigCommands::Path => show_paths(config_path),
    }
}

fn show_config(config_path: Option<&Path>) -> Result<()> {
    let config = EngineConfig::load_or_default(config_path)?;
    println!("{}", config.to_toml_string()?);
    Ok(())
}

fn show_paths(config_path: Option<&Path>) -> Result<()> {
    let config = EngineConfig::load_or_default(config_path)?;
    let file = config_path
        .map(Path::to_path_buf)
        .or_else(EngineConfig::default_path);
    println!("Config file: {:?}", file);
    println!("Data dir:    {:?}", config.storage.data_dir);
    println!("Audit log:   {:?}", config.storage.audit_log_path());
    Ok(())
}
