// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Event Normalizer
//!
//! Maps external event-type strings onto canonical identifiers using a
//! static, append-only table. Normalization is total (unresolved input maps
//! to itself) and idempotent: canonical types always resolve to themselves.

use std::collections::HashMap;

use crate::domain::events::event_types::{self, *};

/// External alias → canonical type. Append new aliases at the end.
const NORMALIZATION_TABLE: &[(&str, &str)] = &[
    ("semantic.validation.request", SPECIFICATION_VALIDATE),
    ("spec.validate", SPECIFICATION_VALIDATE),
    ("specification.validation.requested", SPECIFICATION_VALIDATE),
    ("knowledge.retrieval.request", KNOWLEDGE_QUERY),
    ("knowledge.search", KNOWLEDGE_QUERY),
    ("compliance.rules.evaluate", COMPLIANCE_CHECK),
    ("compliance.validation.request", COMPLIANCE_CHECK),
    ("context.propagate", CONTEXT_UPDATE),
    ("context.slice.delivered", CONTEXT_UPDATE),
    ("orchestrator.phase.dispatch", PHASE_EXECUTE),
    ("workflow.phase.start", PHASE_EXECUTE),
    ("consensus.request", VOTE_REQUEST),
    ("consensus.vote", VOTE_REQUEST),
    ("validation.error", VALIDATION_FAILED),
    ("error.validation", VALIDATION_FAILED),
];

#[derive(Debug, Clone)]
pub struct EventNormalizer {
    table: HashMap<&'static str, &'static str>,
}

impl EventNormalizer {
    pub fn new() -> Self {
        let mut table: HashMap<&'static str, &'static str> = event_types::ALL
            .iter()
            .map(|canonical| (*canonical, *canonical))
            .collect();
        for &(alias, canonical) in NORMALIZATION_TABLE {
            table.entry(alias).or_insert(canonical);
        }
        Self { table }
    }

    /// Canonical type for `raw`, or `None` when the input is not known.
    pub fn resolve(&self, raw: &str) -> Option<&'static str> {
        self.table.get(raw).copied()
    }

    /// Total normalization: unresolved input is returned unchanged.
    pub fn normalize(&self, raw: &str) -> String {
        self.resolve(raw)
            .map(str::to_string)
            .unwrap_or_else(|| raw.to_string())
    }

    pub fn is_canonical(&self, event_type: &str) -> bool {
        event_types::ALL.contains(&event_type)
    }

    /// Routing key for `raw`: the canonical type, or `unknown.<raw>` when unresolved.
    pub fn routing_key(&self, raw: &str) -> (String, bool) {
        match self.resolve(raw) {
            Some(canonical) => (canonical.to_string(), false),
            None if raw.starts_with(UNKNOWN_PREFIX) => (raw.to_string(), true),
            None => (format!("{}{}", UNKNOWN_PREFIX, raw), true),
        }
    }

    pub fn aliases(&self) -> impl Iterator<Item = (&'static str, &'static str)> + '_ {
        self.table.iter().map(|(alias, canonical)| (*alias, *canonical))
    }
}

impl Default for EventNormalizer {
    fn default() -> Self {
        Self::new()
    }
}
