// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Concord CLI
//!
//! The `concord` binary drives an in-process coordination runtime.
//!
//! ## Commands
//!
//! - `concord normalize <TYPE>` - Resolve an event type to its canonical name
//! - `concord validate --type T --payload JSON|@file` - Validate a payload
//! - `concord workflow check|run <FILE>` - Check or execute a workflow definition
//! - `concord config show|validate|generate` - Configuration management

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use concord_cli::commands::{self, ConfigCommand, WorkflowCommand};

/// Concord - coordinate independent agents through validated events and DAG workflows
#[derive(Parser)]
#[command(name = "concord")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
#[command(arg_required_else_help = true)]
struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(
        short,
        long,
        global = true,
        env = "CONCORD_CONFIG_PATH",
        value_name = "FILE"
    )]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "CONCORD_LOG_LEVEL", default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve an event type to its canonical name
    #[command(name = "normalize")]
    Normalize {
        /// Raw event type
        #[arg(value_name = "TYPE")]
        event_type: String,
    },

    /// Validate an event payload against the registered schemas
    #[command(name = "validate")]
    Validate {
        /// Raw event type
        #[arg(long = "type", short = 't', value_name = "TYPE")]
        event_type: String,

        /// Payload as inline JSON, or @path to read it from a file
        #[arg(long, short = 'p', value_name = "JSON|@FILE")]
        payload: String,
    },

    /// Workflow definitions
    #[command(name = "workflow")]
    Workflow {
        #[command(subcommand)]
        command: WorkflowCommand,
    },

    /// Configuration management
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    init_logging(&cli.log_level)?;

    match cli.command {
        Commands::Normalize { event_type } => commands::event::normalize(&event_type),
        Commands::Validate { event_type, payload } => {
            commands::event::validate(&event_type, &payload, cli.config)
        }
        Commands::Workflow { command } => {
            commands::workflow::handle_command(command, cli.config).await
        }
        Commands::Config { command } => {
            commands::config::handle_command(command, cli.config).await
        }
    }
}

/// Initialize tracing subscriber for logging
fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();

    Ok(())
}
