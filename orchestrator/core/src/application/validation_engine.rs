// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Event Validation Engine
//!
//! Every event entering the bus passes through [`EventValidationEngine::validate`]:
//!
//! 1. unwrap a legacy `unknown.event.received` envelope,
//! 2. normalize the type; a type with no registered schema becomes `unknown.<raw>`
//!    and passes through flagged,
//! 3. check the payload against the registered schema and fill declared defaults,
//! 4. decode the normalized payload into its [`CanonicalEvent`] variant.
//!
//! Outcomes are cached by `(normalized type, payload fingerprint)`.

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::domain::events::event_types::{LEGACY_ENVELOPE, UNKNOWN_PREFIX};
use crate::domain::events::CanonicalEvent;
use crate::domain::normalizer::EventNormalizer;
use crate::domain::schema::{FieldError, SchemaEntry};
use crate::infrastructure::schema_registry::SchemaRegistry;

/// Nested legacy envelopes are unwrapped at most this deep.
const MAX_ENVELOPE_DEPTH: usize = 8;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationOutcome {
    pub is_valid: bool,
    pub normalized_type: String,
    pub normalized_payload: Value,
    pub errors: Vec<FieldError>,
    /// No schema covers the type; the payload passed through unvalidated.
    pub unknown: bool,
    /// Typed payload, present whenever `is_valid` is true.
    #[serde(skip)]
    pub body: Option<CanonicalEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub capacity: usize,
}

type CacheKey = (String, String);

pub struct EventValidationEngine {
    normalizer: EventNormalizer,
    registry: Arc<SchemaRegistry>,
    cache: Mutex<LruCache<CacheKey, Arc<ValidationOutcome>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl EventValidationEngine {
    pub fn new(registry: Arc<SchemaRegistry>, cache_capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            normalizer: EventNormalizer::new(),
            registry,
            cache: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn normalizer(&self) -> &EventNormalizer {
        &self.normalizer
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    /// Key an event of type `raw` is routed under, and whether it is unknown.
    ///
    /// A type is known exactly when a schema covers it: either its canonical
    /// form or, for types registered directly, its own name. Everything else
    /// routes under `unknown.<raw>`, whether or not the normalizer resolves it.
    pub fn routing_key(&self, raw: &str) -> (String, bool) {
        let candidate = self.normalizer.resolve(raw).unwrap_or(raw);
        if self.registry.contains(candidate) {
            return (candidate.to_string(), false);
        }
        match self.normalizer.resolve(raw) {
            Some(_) => (format!("{}{}", UNKNOWN_PREFIX, raw), true),
            None => self.normalizer.routing_key(raw),
        }
    }

    pub fn validate(&self, raw_type: &str, payload: &Value) -> Arc<ValidationOutcome> {
        let (raw_type, payload) = unwrap_envelope(raw_type, payload);
        let (normalized_type, unknown) = self.routing_key(raw_type);

        let key = (normalized_type.clone(), fingerprint(payload));
        if let Some(hit) = self.cache.lock().get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("concord_validation_cache_hits_total").increment(1);
            return Arc::clone(hit);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let outcome = Arc::new(self.compute(normalized_type, unknown, payload));
        self.cache.lock().put(key, Arc::clone(&outcome));
        outcome
    }

    pub fn cache_stats(&self) -> CacheStats {
        let cache = self.cache.lock();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: cache.len(),
            capacity: cache.cap().get(),
        }
    }

    fn compute(&self, normalized_type: String, unknown: bool, payload: &Value) -> ValidationOutcome {
        let schema = match self.registry.get(&normalized_type) {
            Some(entry) if !unknown => entry,
            _ => Arc::new(SchemaEntry::permissive(normalized_type.as_str())),
        };

        if schema.is_permissive() {
            debug!(event_type = %normalized_type, "No schema for event type, passing through");
            return ValidationOutcome {
                is_valid: true,
                body: Some(CanonicalEvent::unknown(&normalized_type, payload.clone())),
                normalized_payload: schema.apply_defaults(payload),
                normalized_type,
                errors: Vec::new(),
                unknown: true,
            };
        }

        let errors = schema.check(payload);
        if !errors.is_empty() {
            return ValidationOutcome {
                is_valid: false,
                normalized_type,
                normalized_payload: payload.clone(),
                errors,
                unknown: false,
                body: None,
            };
        }

        let normalized_payload = schema.apply_defaults(payload);
        match CanonicalEvent::decode(&normalized_type, &normalized_payload) {
            Ok(body) => ValidationOutcome {
                is_valid: true,
                normalized_type,
                normalized_payload,
                errors: Vec::new(),
                unknown: false,
                body: Some(body),
            },
            Err(e) => ValidationOutcome {
                is_valid: false,
                normalized_type,
                normalized_payload,
                errors: vec![FieldError::new("payload", e.to_string())],
                unknown: false,
                body: None,
            },
        }
    }
}

/// Peel `unknown.event.received` envelopes carrying an inner `eventType`/`payload`.
fn unwrap_envelope<'a>(raw_type: &'a str, payload: &'a Value) -> (&'a str, &'a Value) {
    let mut current = (raw_type, payload);
    for _ in 0..MAX_ENVELOPE_DEPTH {
        if current.0 != LEGACY_ENVELOPE {
            break;
        }
        let inner_type = current
            .1
            .get("eventType")
            .or_else(|| current.1.get("type"))
            .and_then(Value::as_str);
        let inner_payload = current.1.get("payload");
        match (inner_type, inner_payload) {
            (Some(t), Some(p)) => current = (t, p),
            _ => break,
        }
    }
    current
}

/// SHA-256 over a key-sorted rendering of `value`.
fn fingerprint(value: &Value) -> String {
    let mut hasher = Sha256::new();
    feed_canonical(&mut hasher, value);
    hex::encode(hasher.finalize())
}

fn feed_canonical(hasher: &mut Sha256, value: &Value) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            hasher.update(b"{");
            for key in keys {
                hasher.update(Value::String(key.clone()).to_string().as_bytes());
                hasher.update(b":");
                feed_canonical(hasher, &map[key.as_str()]);
                hasher.update(b",");
            }
            hasher.update(b"}");
        }
        Value::Array(items) => {
            hasher.update(b"[");
            for item in items {
                feed_canonical(hasher, item);
                hasher.update(b",");
            }
            hasher.update(b"]");
        }
        scalar => hasher.update(scalar.to_string().as_bytes()),
    }
}
