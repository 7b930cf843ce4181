// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Workflow command implementations
//!
//! # Commands
//!
//! - `concord workflow check <file>` - Parse the definition and validate its graph
//! - `concord workflow run <file>` - Execute it against the built-in agents

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use serde_json::Value;
use std::path::{Path, PathBuf};

use concord_core::domain::workflow::{Dag, NodeState, RunReport, RunState, WorkflowDefinition};
use concord_core::infrastructure::workflow_parser::WorkflowParser;
use concord_core::CoordinationRuntime;

use crate::agents::{BuiltinAgent, BuiltinKind};
use crate::commands::{config, event};

#[derive(Subcommand)]
pub enum WorkflowCommand {
    /// Parse a workflow definition and validate its graph
    Check {
        /// Path to workflow definition (YAML or JSON)
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// Execute a workflow against the built-in agents
    Run {
        /// Path to workflow definition (YAML or JSON)
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Workflow input as inline JSON, or @path to read it from a file
        #[arg(long, short = 'i', value_name = "JSON|@FILE")]
        input: Option<String>,

        /// Print the full run report as JSON
        #[arg(long)]
        json: bool,
    },
}

pub async fn handle_command(command: WorkflowCommand, config_path: Option<PathBuf>) -> Result<()> {
    match command {
        WorkflowCommand::Check { file } => check_workflow(&file),
        WorkflowCommand::Run { file, input, json } => run_workflow(&file, input, json, config_path).await,
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

fn check_workflow(file: &Path) -> Result<()> {
    println!("Checking workflow definition: {}", file.display());

    let definition = load_definition(file)?;
    let dag = Dag::build(definition).context("Workflow graph is invalid")?;

    println!("{}", "✓ Workflow definition is valid".green());
    println!();
    println!("{}", "Workflow Details:".bold());
    println!("  Name: {}", dag.name());
    println!("  Phases: {}", dag.len());
    println!(
        "  Execution order: {}",
        dag.topological_order()
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(" → ")
    );

    let unresolved: Vec<String> = dag
        .agents()
        .into_iter()
        .filter(|agent| BuiltinKind::resolve(agent.as_str()).is_none())
        .map(|agent| agent.to_string())
        .collect();
    if !unresolved.is_empty() {
        println!(
            "  {} not built in (run needs one of: {}): {}",
            "⚠".yellow(),
            BuiltinKind::names().join(", "),
            unresolved.join(", ")
        );
    }

    Ok(())
}

async fn run_workflow(
    file: &Path,
    input: Option<String>,
    as_json: bool,
    config_path: Option<PathBuf>,
) -> Result<()> {
    let config = config::load(config_path)?;
    config.validate().context("Configuration validation failed")?;

    let definition = load_definition(file)?;
    let input = match input {
        Some(arg) => event::read_payload(&arg)?,
        None => Value::Null,
    };

    let runtime = CoordinationRuntime::new(config);
    register_builtin_agents(&runtime, &definition)?;
    runtime.start().await;

    println!("{} {}", "Running workflow".bold(), definition.name.cyan());
    let result = runtime.run_workflow(definition, input).await;
    runtime.shutdown().await;
    let report = result.context("Workflow could not be started")?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    match report.state {
        RunState::Completed => Ok(()),
        state => anyhow::bail!("workflow finished {}", state),
    }
}

fn load_definition(file: &Path) -> Result<WorkflowDefinition> {
    WorkflowParser::parse_file(file)
        .with_context(|| format!("Failed to parse workflow definition {}", file.display()))
}

/// Register one built-in agent per distinct agent id the workflow names.
fn register_builtin_agents(runtime: &CoordinationRuntime, definition: &WorkflowDefinition) -> Result<()> {
    let mut ids: Vec<_> = definition
        .phases
        .iter()
        .flat_map(|phase| {
            std::iter::once(phase.agent.clone())
                .chain(phase.consensus.iter().flat_map(|c| c.required_agents.iter().cloned()))
        })
        .collect();
    ids.sort();
    ids.dedup();

    for id in ids {
        let agent = BuiltinAgent::for_id(&id).with_context(|| {
            format!(
                "Agent '{}' is not built in; available: {}",
                id,
                BuiltinKind::names().join(", ")
            )
        })?;
        runtime.register_agent(agent)?;
    }
    Ok(())
}

fn print_report(report: &RunReport) {
    println!();
    println!("{}", "Phases:".bold());
    for (name, node) in &report.nodes {
        let state = match node.state {
            NodeState::Completed => node.state.to_string().green(),
            NodeState::Failed => node.state.to_string().red(),
            NodeState::Skipped => node.state.to_string().yellow(),
            NodeState::Pending | NodeState::Running => node.state.to_string().dimmed(),
        };
        let took = node
            .duration()
            .map(|d| format!(" ({} ms)", d.as_millis()))
            .unwrap_or_default();
        println!("  {:<20} {}{}", name, state, took.dimmed());

        if let Some(error) = &node.error {
            println!("    {}", error.to_string().red());
        }
        if let Some(reason) = &node.skip_reason {
            println!("    {}", format!("{:?}", reason).dimmed());
        }
        if let Some(consensus) = &node.consensus {
            let approvals: Vec<String> = consensus.approvals.iter().map(|a| a.to_string()).collect();
            println!(
                "    consensus {}: approved by [{}]",
                if consensus.reached { "reached".green() } else { "not reached".red() },
                approvals.join(", ")
            );
        }
    }

    println!();
    let state = match report.state {
        RunState::Completed => report.state.to_string().green(),
        RunState::Running => report.state.to_string().dimmed(),
        RunState::Failed | RunState::PartiallyFailed | RunState::Cancelled => report.state.to_string().red(),
    };
    println!("Run {} {}", report.run_id, state);
}
