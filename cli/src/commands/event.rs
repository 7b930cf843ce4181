// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Event inspection commands
//!
//! - `concord normalize <TYPE>` - print the canonical type (or the unknown routing key)
//! - `concord validate --type T --payload JSON|@file` - run the validation engine once

use anyhow::{Context, Result};
use colored::Colorize;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;

use concord_core::application::validation_engine::EventValidationEngine;
use concord_core::infrastructure::schema_registry::SchemaRegistry;

use crate::commands::config;

pub fn normalize(event_type: &str) -> Result<()> {
    let engine = EventValidationEngine::new(Arc::new(SchemaRegistry::with_builtin_schemas()), 1);
    let (routing_key, unknown) = engine.routing_key(event_type);

    if unknown {
        println!("{} {}", routing_key.yellow(), "(unknown type)".dimmed());
    } else {
        println!("{}", routing_key.green());
    }
    Ok(())
}

pub fn validate(event_type: &str, payload: &str, config_path: Option<PathBuf>) -> Result<()> {
    let config = config::load(config_path)?;
    let payload = read_payload(payload)?;
    let engine = EventValidationEngine::new(
        Arc::new(SchemaRegistry::with_builtin_schemas()),
        config.spec.validation.cache_capacity,
    );

    let outcome = engine.validate(event_type, &payload);
    println!("Type: {}", outcome.normalized_type.bold());

    if outcome.unknown {
        println!("{}", "⚠ No schema for this type; payload passes through unvalidated".yellow());
    }

    if outcome.is_valid {
        println!("{}", "✓ Payload is valid".green());
        println!("{}", serde_json::to_string_pretty(&outcome.normalized_payload)?);
        return Ok(());
    }

    println!("{}", "✗ Payload is invalid".red());
    for error in &outcome.errors {
        println!("  {} {}", error.field.bold(), error.reason);
    }
    anyhow::bail!("validation failed with {} error(s)", outcome.errors.len())
}

/// Inline JSON, or `@path` to read JSON from a file.
pub fn read_payload(arg: &str) -> Result<Value> {
    let text = match arg.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read payload file {}", path))?,
        None => arg.to_string(),
    };
    serde_json::from_str(&text).context("Payload is not valid JSON")
}
