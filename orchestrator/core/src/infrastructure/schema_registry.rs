// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Schema Registry - canonical event type -> payload schema
//
// Populated during runtime construction, then shared read-only behind an
// `Arc`. Registration is additive: a canonical type is registered once.

use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::domain::events::event_types::*;
use crate::domain::schema::{FieldType, SchemaDescriptor, SchemaEntry};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemaRegistryError {
    #[error("Schema already registered for event type '{0}'")]
    Duplicate(String),

    #[error("Schema event type cannot be empty")]
    EmptyType,
}

#[derive(Debug, Default)]
pub struct SchemaRegistry {
    entries: HashMap<String, Arc<SchemaEntry>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-loaded with a schema for every canonical event type.
    pub fn with_builtin_schemas() -> Self {
        let mut registry = Self::new();
        registry.ensure_builtin_schemas();
        registry
    }

    /// Add the built-in schema of every canonical type not registered yet.
    /// Schemas already present are left untouched.
    pub fn ensure_builtin_schemas(&mut self) {
        for (canonical_type, descriptor) in builtin_schemas() {
            self.entries
                .entry(canonical_type.to_string())
                .or_insert_with(|| Arc::new(SchemaEntry::new(canonical_type, descriptor)));
        }
    }

    pub fn register_schema(
        &mut self,
        canonical_type: impl Into<String>,
        descriptor: SchemaDescriptor,
    ) -> Result<Arc<SchemaEntry>, SchemaRegistryError> {
        let canonical_type = canonical_type.into();
        if canonical_type.is_empty() {
            return Err(SchemaRegistryError::EmptyType);
        }
        if self.entries.contains_key(&canonical_type) {
            return Err(SchemaRegistryError::Duplicate(canonical_type));
        }

        let entry = Arc::new(SchemaEntry::new(canonical_type.clone(), descriptor));
        tracing::debug!(event_type = %canonical_type, "Registered event schema");
        self.entries.insert(canonical_type, Arc::clone(&entry));
        Ok(entry)
    }

    pub fn get(&self, canonical_type: &str) -> Option<Arc<SchemaEntry>> {
        self.entries.get(canonical_type).cloned()
    }

    pub fn contains(&self, canonical_type: &str) -> bool {
        self.entries.contains_key(canonical_type)
    }

    pub fn event_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn builtin_schemas() -> Vec<(&'static str, SchemaDescriptor)> {
    vec![
        (
            SPECIFICATION_VALIDATE,
            SchemaDescriptor::new()
                .required("specification", FieldType::Object)
                .required("specification.id", FieldType::String)
                .required("specification.capabilities", FieldType::Array)
                .optional("specification.version", FieldType::String)
                .optional("specification.description", FieldType::String),
        ),
        (
            KNOWLEDGE_QUERY,
            SchemaDescriptor::new()
                .required("query", FieldType::String)
                .optional_with_default("limit", FieldType::Integer, json!(10))
                .optional_with_default("filters", FieldType::Object, json!({})),
        ),
        (
            COMPLIANCE_CHECK,
            SchemaDescriptor::new()
                .required("subject", FieldType::String)
                .required_array_of("rules", FieldType::String)
                .optional_with_default("strict", FieldType::Boolean, json!(false)),
        ),
        (
            CONTEXT_UPDATE,
            SchemaDescriptor::new()
                .required("slice_id", FieldType::String)
                .required("owner_agent", FieldType::String)
                .required("priority", FieldType::String)
                .optional("domain", FieldType::String)
                .optional("state", FieldType::Any)
                .optional_with_default("metadata", FieldType::Object, json!({}))
                .optional("expires_at", FieldType::String),
        ),
        (
            PHASE_EXECUTE,
            SchemaDescriptor::new()
                .required("run_id", FieldType::String)
                .required("phase", FieldType::String)
                .optional("input", FieldType::Any)
                .optional_with_default("upstream", FieldType::Object, json!({})),
        ),
        (
            VOTE_REQUEST,
            SchemaDescriptor::new()
                .required("run_id", FieldType::String)
                .required("phase", FieldType::String)
                .required("threshold", FieldType::Integer)
                .required_array_of("required_agents", FieldType::String)
                .optional("proposal", FieldType::Any),
        ),
        (
            VALIDATION_FAILED,
            SchemaDescriptor::new()
                .required("original_type", FieldType::String)
                .required_array_of("errors", FieldType::Object),
        ),
    ]
}
