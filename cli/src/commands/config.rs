// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use concord_core::domain::coordinator_config::CoordinatorConfig;

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,

        /// Print the effective configuration as YAML
        #[arg(long)]
        yaml: bool,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Generate a configuration file with every default spelled out
    Generate {
        /// Output path
        #[arg(short, long, default_value = "./concord-config.yaml")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

pub async fn handle_command(
    command: ConfigCommand,
    config_override: Option<PathBuf>,
) -> Result<()> {
    match command {
        ConfigCommand::Show { paths, yaml } => show(config_override, paths, yaml),
        ConfigCommand::Validate { file } => validate(file.or(config_override)),
        ConfigCommand::Generate { output, force } => generate(output, force),
    }
}

/// Effective configuration: file (or defaults) with env overrides applied.
pub fn load(config_override: Option<PathBuf>) -> Result<CoordinatorConfig> {
    CoordinatorConfig::load_or_default(config_override).context("Failed to load configuration")
}

fn show(config_override: Option<PathBuf>, show_paths: bool, as_yaml: bool) -> Result<()> {
    let config = load(config_override.clone())?;

    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        if let Some(path) = &config_override {
            println!("  1. --config flag: {}", path.display());
        } else {
            println!("  1. --config flag: {}", "(not set)".dimmed());
        }
        println!(
            "  2. CONCORD_CONFIG_PATH: {}",
            std::env::var("CONCORD_CONFIG_PATH")
                .unwrap_or_else(|_| "(not set)".to_string())
                .dimmed()
        );
        println!("  3. ./concord-config.yaml");
        println!("  4. ~/.concord/config.yaml");
        println!("  5. /etc/concord/config.yaml");
        println!();
    }

    if as_yaml {
        print!("{}", config.to_yaml_string()?);
        return Ok(());
    }

    let spec = &config.spec;
    println!("{}", "Current configuration:".bold());
    println!("  Name: {}", config.metadata.name);
    println!();

    println!("{}", "Event Bus:".bold());
    println!("  History capacity: {}", spec.bus.history_capacity);
    println!("  Notice capacity: {}", spec.bus.notice_capacity);
    println!();

    println!("{}", "Validation:".bold());
    println!("  Cache capacity: {}", spec.validation.cache_capacity);
    println!();

    println!("{}", "Context:".bold());
    println!("  Sweep interval: {:?}", spec.context.sweep_interval);
    match spec.context.default_ttl {
        Some(ttl) => println!("  Default TTL: {:?}", ttl),
        None => println!("  Default TTL: {}", "(none)".dimmed()),
    }
    println!();

    println!("{}", "Orchestrator:".bold());
    println!("  Max concurrency: {}", spec.orchestrator.max_concurrency);
    println!("  Node timeout: {:?}", spec.orchestrator.node_timeout);
    println!("  Consensus timeout: {:?}", spec.orchestrator.consensus_timeout);
    println!("  Failure policy: {:?}", spec.orchestrator.failure_policy);

    Ok(())
}

fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config = load(config_path)?;
    config
        .validate()
        .context("Configuration validation failed")?;

    println!("{}", "✓ Configuration is valid".green());
    Ok(())
}

fn generate(output: PathBuf, force: bool) -> Result<()> {
    if output.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", output.display());
    }

    CoordinatorConfig::default()
        .to_yaml_file(&output)
        .with_context(|| format!("Failed to write config to {:?}", output))?;

    println!(
        "{}",
        format!("✓ Configuration generated: {}", output.display()).green()
    );
    Ok(())
}
