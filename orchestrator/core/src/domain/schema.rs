// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Event Schemas
//!
//! Structural descriptors for canonical event payloads. A [`SchemaEntry`]
//! lists field descriptors addressed by dotted path
//! (`specification.capabilities`). Validation reports one [`FieldError`] per
//! offending field; fields the schema does not mention are ignored so older
//! schemas accept newer producers. Array fields may declare an element type,
//! in which case offending elements are reported by index (`rules[2]`).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Expected JSON shape of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
    Any,
}

impl FieldType {
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Array => value.is_array(),
            FieldType::Object => value.is_object(),
            FieldType::Any => !value.is_null(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Integer => "integer",
            FieldType::Boolean => "boolean",
            FieldType::Array => "array",
            FieldType::Object => "object",
            FieldType::Any => "any",
        }
    }
}

fn describe(value: Option<&Value>) -> &'static str {
    match value {
        None => "undefined",
        Some(Value::Null) => "null",
        Some(Value::Bool(_)) => "boolean",
        Some(Value::Number(_)) => "number",
        Some(Value::String(_)) => "string",
        Some(Value::Array(_)) => "array",
        Some(Value::Object(_)) => "object",
    }
}

/// One offending field, rendered as `field: reason`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub reason: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn missing(field: impl Into<String>) -> Self {
        Self::new(field, "required field missing")
    }
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.reason)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    /// Dotted path into the payload.
    pub path: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    /// Value filled into the normalized payload when an optional field is absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Element type of an array field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<FieldType>,
}

impl FieldDescriptor {
    pub fn required(path: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            path: path.into(),
            field_type,
            required: true,
            default: None,
            items: None,
        }
    }

    pub fn optional(path: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            path: path.into(),
            field_type,
            required: false,
            default: None,
            items: None,
        }
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    /// Turn the field into an array whose elements must match `item_type`.
    pub fn of(mut self, item_type: FieldType) -> Self {
        self.field_type = FieldType::Array;
        self.items = Some(item_type);
        self
    }

    fn check_value(&self, value: &Value, errors: &mut Vec<FieldError>) {
        if !self.field_type.matches(value) {
            errors.push(FieldError::new(
                &self.path,
                format!("expected {}, got {}", self.field_type.name(), describe(Some(value))),
            ));
            return;
        }
        let (Some(item_type), Some(elements)) = (self.items, value.as_array()) else {
            return;
        };
        for (index, element) in elements.iter().enumerate() {
            if !item_type.matches(element) {
                errors.push(FieldError::new(
                    format!("{}[{}]", self.path, index),
                    format!("expected {}, got {}", item_type.name(), describe(Some(element))),
                ));
            }
        }
    }
}

/// Field list for one canonical event type, built with a small fluent API.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    pub fields: Vec<FieldDescriptor>,
}

impl SchemaDescriptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(mut self, path: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.push(FieldDescriptor::required(path, field_type));
        self
    }

    pub fn optional(mut self, path: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.push(FieldDescriptor::optional(path, field_type));
        self
    }

    pub fn required_array_of(mut self, path: impl Into<String>, item_type: FieldType) -> Self {
        self.fields
            .push(FieldDescriptor::required(path, FieldType::Array).of(item_type));
        self
    }

    pub fn optional_array_of(mut self, path: impl Into<String>, item_type: FieldType) -> Self {
        self.fields
            .push(FieldDescriptor::optional(path, FieldType::Array).of(item_type));
        self
    }

    pub fn optional_with_default(
        mut self,
        path: impl Into<String>,
        field_type: FieldType,
        default: Value,
    ) -> Self {
        self.fields
            .push(FieldDescriptor::optional(path, field_type).with_default(default));
        self
    }
}

/// Immutable schema registered for one canonical event type.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaEntry {
    canonical_type: String,
    descriptor: SchemaDescriptor,
    permissive: bool,
}

impl SchemaEntry {
    pub fn new(canonical_type: impl Into<String>, descriptor: SchemaDescriptor) -> Self {
        Self {
            canonical_type: canonical_type.into(),
            descriptor,
            permissive: false,
        }
    }

    /// Passthrough schema for event types without a registered schema:
    /// accepts any payload and declares no defaults.
    pub fn permissive(canonical_type: impl Into<String>) -> Self {
        Self {
            canonical_type: canonical_type.into(),
            descriptor: SchemaDescriptor::default(),
            permissive: true,
        }
    }

    pub fn canonical_type(&self) -> &str {
        &self.canonical_type
    }

    pub fn descriptor(&self) -> &SchemaDescriptor {
        &self.descriptor
    }

    pub fn is_permissive(&self) -> bool {
        self.permissive
    }

    /// Structural check: required fields present and type-correct, optional
    /// fields type-correct when present.
    pub fn check(&self, payload: &Value) -> Vec<FieldError> {
        if self.permissive {
            return Vec::new();
        }

        let mut errors = Vec::new();
        for field in &self.descriptor.fields {
            let value = lookup_path(payload, &field.path);
            match value {
                None if field.required => errors.push(FieldError::missing(&field.path)),
                None => {}
                // An explicit null on an optional field counts as absent.
                Some(Value::Null) if !field.required => {}
                Some(v) => field.check_value(v, &mut errors),
            }
        }
        errors
    }

    /// Copy of `payload` with declared defaults filled into absent optional fields.
    pub fn apply_defaults(&self, payload: &Value) -> Value {
        let mut normalized = payload.clone();
        for field in &self.descriptor.fields {
            let Some(default) = &field.default else {
                continue;
            };
            let absent = matches!(lookup_path(&normalized, &field.path), None | Some(Value::Null));
            if !field.required && absent {
                insert_path(&mut normalized, &field.path, default.clone());
            }
        }
        normalized
    }
}

/// Resolve a dotted path inside a JSON value.
pub fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(value, |current, segment| current.as_object()?.get(segment))
}

fn insert_path(value: &mut Value, path: &str, new_value: Value) {
    let segments: Vec<&str> = path.split('.').collect();
    let Some((last, parents)) = segments.split_last() else {
        return;
    };

    let mut current = value;
    for segment in parents {
        let Some(object) = current.as_object_mut() else {
            return;
        };
        current = object
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if let Some(object) = current.as_object_mut() {
        object.insert(last.to_string(), new_value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec_schema() -> SchemaEntry {
        SchemaEntry::new(
            "specification.validate",
            SchemaDescriptor::new()
                .required("specification.id", FieldType::String)
                .required("specification.capabilities", FieldType::Array)
                .optional("specification.version", FieldType::String)
                .optional_with_default("strict", FieldType::Boolean, json!(false)),
        )
    }

    #[test]
    fn test_valid_payload_has_no_errors() {
        let payload = json!({
            "specification": { "id": "s-1", "capabilities": [], "unrelated": 5 }
        });
        assert!(spec_schema().check(&payload).is_empty());
    }

    #[test]
    fn test_missing_required_field_is_field_qualified() {
        let payload = json!({ "specification": { "capabilities": [] } });
        let errors = spec_schema().check(&payload);
        assert_eq!(errors, vec![FieldError::missing("specification.id")]);
        assert_eq!(errors[0].to_string(), "specification.id: required field missing");
    }

    #[test]
    fn test_type_mismatch_reports_expected_and_actual() {
        let payload = json!({
            "specification": { "id": "s-1", "capabilities": "all", "version": 2 }
        });
        let errors = spec_schema().check(&payload);
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].to_string(), "specification.capabilities: expected array, got string");
        assert_eq!(errors[1].to_string(), "specification.version: expected string, got number");
    }

    #[test]
    fn test_non_object_payload_reports_every_required_field() {
        let errors = spec_schema().check(&json!("not an object"));
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn test_permissive_schema_accepts_anything() {
        let entry = SchemaEntry::permissive("unknown.thing");
        assert!(entry.check(&json!(42)).is_empty());
        assert!(entry.is_permissive());
    }

    #[test]
    fn test_apply_defaults_preserves_existing_values() {
        let entry = spec_schema();
        let payload = json!({ "specification": { "id": "s-1", "capabilities": [1] } });
        let normalized = entry.apply_defaults(&payload);
        assert_eq!(normalized["strict"], json!(false));
        assert_eq!(normalized["specification"], payload["specification"]);

        let explicit = json!({ "specification": { "id": "s-1", "capabilities": [] }, "strict": true });
        assert_eq!(entry.apply_defaults(&explicit)["strict"], json!(true));
    }

    #[test]
    fn test_array_elements_are_reported_by_index() {
        let entry = SchemaEntry::new(
            "vote.request",
            SchemaDescriptor::new()
                .required_array_of("voters", FieldType::String)
                .optional_array_of("weights", FieldType::Integer),
        );
        assert!(entry.check(&json!({ "voters": ["a", "b"] })).is_empty());

        let errors = entry.check(&json!({ "voters": ["a", 1, null], "weights": [1, 2.5] }));
        let rendered: Vec<String> = errors.iter().map(ToString::to_string).collect();
        assert_eq!(
            rendered,
            vec![
                "voters[1]: expected string, got number",
                "voters[2]: expected string, got null",
                "weights[1]: expected integer, got number",
            ]
        );

        // A non-array value is reported once, at the field itself.
        assert_eq!(
            entry.check(&json!({ "voters": "a" })),
            vec![FieldError::new("voters", "expected array, got string")]
        );
    }

    #[test]
    fn test_lookup_path() {
        let value = json!({ "a": { "b": { "c": 1 } } });
        assert_eq!(lookup_path(&value, "a.b.c"), Some(&json!(1)));
        assert_eq!(lookup_path(&value, "a.x"), None);
        assert_eq!(lookup_path(&value, "a.b.c.d"), None);
    }

    #[test]
    fn test_integer_type_rejects_floats() {
        assert!(FieldType::Integer.matches(&json!(3)));
        assert!(!FieldType::Integer.matches(&json!(3.5)));
        assert!(FieldType::Number.matches(&json!(3.5)));
    }
}
