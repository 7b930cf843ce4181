// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Coordination Events
//!
//! Wire-level and delivered representations of events routed by the
//! [`EventBus`](crate::infrastructure::event_bus::EventBus).
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Event`] | Envelope with tracing metadata attached at ingress |
//! | [`CanonicalEvent`] | Typed payload variant, one per canonical event type |
//! | [`DeliveredEvent`] | Immutable view handed to subscribers |
//! | [`CoordinationNotice`] | Observer stream entries (deliveries, faults, DAG transitions) |
//!
//! Payloads are decoded into a [`CanonicalEvent`] exactly once, at the bus
//! boundary, after structural validation. Agents match on the variant instead
//! of probing loosely-typed JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use uuid::Uuid;

use crate::domain::agent::AgentId;
use crate::domain::context::Priority;
use crate::domain::schema::FieldError;
use crate::domain::workflow::{NodeState, RunId, RunState};

/// Canonical event type identifiers.
///
/// The normalizer maps every known external alias onto one of these.
pub mod event_types {
    pub const SPECIFICATION_VALIDATE: &str = "specification.validate";
    pub const KNOWLEDGE_QUERY: &str = "knowledge.query";
    pub const COMPLIANCE_CHECK: &str = "compliance.check";
    pub const CONTEXT_UPDATE: &str = "context.update";
    pub const PHASE_EXECUTE: &str = "workflow.phase.execute";
    pub const VOTE_REQUEST: &str = "consensus.vote.request";
    pub const VALIDATION_FAILED: &str = "validation.failed";

    /// Legacy double-wrapped envelope type, unwrapped at ingress.
    pub const LEGACY_ENVELOPE: &str = "unknown.event.received";

    /// Prefix attached to event types no registered schema covers.
    pub const UNKNOWN_PREFIX: &str = "unknown.";

    /// Every canonical type known to the runtime.
    pub const ALL: &[&str] = &[
        SPECIFICATION_VALIDATE,
        KNOWLEDGE_QUERY,
        COMPLIANCE_CHECK,
        CONTEXT_UPDATE,
        PHASE_EXECUTE,
        VOTE_REQUEST,
        VALIDATION_FAILED,
    ];
}

// ============================================================================
// Value Objects: Identifiers
// ============================================================================

/// Identifier assigned once at ingress and carried unchanged through every hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TraceId(pub Uuid);

impl TraceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TraceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TraceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier chaining related events (e.g. every dispatch of one DAG run).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(pub Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<TraceId> for CorrelationId {
    fn from(trace: TraceId) -> Self {
        Self(trace.0)
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Envelope
// ============================================================================

/// An event after the bus attached its tracing metadata.
///
/// `event_type` holds the normalized type once the event passed validation;
/// `payload` holds the normalized payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: Value,
    pub source_agent: AgentId,
    pub trace_id: TraceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
    /// Restricts delivery to these agents when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<BTreeSet<AgentId>>,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn is_targeted_at(&self, agent: &AgentId) -> bool {
        self.target.as_ref().map(|t| t.contains(agent)).unwrap_or(true)
    }
}

/// Immutable view of a validated event, shared by reference between subscribers.
#[derive(Debug, Clone)]
pub struct DeliveredEvent {
    pub event: Event,
    pub body: CanonicalEvent,
}

impl DeliveredEvent {
    pub fn canonical_type(&self) -> &str {
        &self.event.event_type
    }

    pub fn payload(&self) -> &Value {
        &self.event.payload
    }

    pub fn trace_id(&self) -> TraceId {
        self.event.trace_id
    }

    pub fn source_agent(&self) -> &AgentId {
        &self.event.source_agent
    }

    /// True when the event type was not resolved and the payload passed through unvalidated.
    pub fn is_unknown(&self) -> bool {
        matches!(self.body, CanonicalEvent::Unknown { .. })
    }
}

// ============================================================================
// Typed payload variants
// ============================================================================

/// Schema-derived payload, one variant per canonical event type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum CanonicalEvent {
    SpecificationValidate(SpecificationValidate),
    KnowledgeQuery(KnowledgeQuery),
    ComplianceCheck(ComplianceCheck),
    ContextUpdate(ContextUpdate),
    PhaseExecute(PhaseExecute),
    VoteRequest(VoteRequest),
    ValidationFailed(ValidationFailed),
    /// Type registered at runtime; structurally validated, payload left untyped.
    Custom { event_type: String, payload: Value },
    /// Unresolved type; payload forwarded as-is and flagged.
    Unknown { event_type: String, payload: Value },
}

impl CanonicalEvent {
    /// Decode a normalized payload into its typed variant.
    ///
    /// Types outside [`event_types::ALL`] decode to [`CanonicalEvent::Custom`].
    pub fn decode(canonical_type: &str, payload: &Value) -> Result<Self, serde_json::Error> {
        use event_types::*;

        let body = match canonical_type {
            SPECIFICATION_VALIDATE => Self::SpecificationValidate(serde_json::from_value(payload.clone())?),
            KNOWLEDGE_QUERY => Self::KnowledgeQuery(serde_json::from_value(payload.clone())?),
            COMPLIANCE_CHECK => Self::ComplianceCheck(serde_json::from_value(payload.clone())?),
            CONTEXT_UPDATE => Self::ContextUpdate(serde_json::from_value(payload.clone())?),
            PHASE_EXECUTE => Self::PhaseExecute(serde_json::from_value(payload.clone())?),
            VOTE_REQUEST => Self::VoteRequest(serde_json::from_value(payload.clone())?),
            VALIDATION_FAILED => Self::ValidationFailed(serde_json::from_value(payload.clone())?),
            other => Self::Custom {
                event_type: other.to_string(),
                payload: payload.clone(),
            },
        };
        Ok(body)
    }

    pub fn unknown(event_type: impl Into<String>, payload: Value) -> Self {
        Self::Unknown {
            event_type: event_type.into(),
            payload,
        }
    }

    pub fn canonical_type(&self) -> &str {
        use event_types::*;

        match self {
            Self::SpecificationValidate(_) => SPECIFICATION_VALIDATE,
            Self::KnowledgeQuery(_) => KNOWLEDGE_QUERY,
            Self::ComplianceCheck(_) => COMPLIANCE_CHECK,
            Self::ContextUpdate(_) => CONTEXT_UPDATE,
            Self::PhaseExecute(_) => PHASE_EXECUTE,
            Self::VoteRequest(_) => VOTE_REQUEST,
            Self::ValidationFailed(_) => VALIDATION_FAILED,
            Self::Custom { event_type, .. } | Self::Unknown { event_type, .. } => event_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecificationValidate {
    pub specification: Specification,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Specification {
    pub id: String,
    pub capabilities: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeQuery {
    pub query: String,
    pub limit: u64,
    #[serde(default)]
    pub filters: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceCheck {
    pub subject: String,
    pub rules: Vec<String>,
    #[serde(default)]
    pub strict: bool,
}

/// Delivery of a context slice to one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextUpdate {
    pub slice_id: String,
    pub owner_agent: AgentId,
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Request for an agent to execute one workflow phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseExecute {
    pub run_id: String,
    pub phase: String,
    #[serde(default)]
    pub input: Value,
    /// Outputs of completed dependencies, keyed by phase name.
    #[serde(default)]
    pub upstream: serde_json::Map<String, Value>,
}

/// Ballot sent to each agent participating in a consensus gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteRequest {
    pub run_id: String,
    pub phase: String,
    pub threshold: u64,
    pub required_agents: Vec<AgentId>,
    #[serde(default)]
    pub proposal: Value,
}

/// Published in place of an event that failed validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationFailed {
    pub original_type: String,
    pub errors: Vec<FieldError>,
}

// ============================================================================
// Observer notices
// ============================================================================

/// Entries published on the bus observer stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinationNotice {
    EventDelivered {
        trace_id: TraceId,
        event_type: String,
        handlers: usize,
        delivered_at: DateTime<Utc>,
    },
    EventRejected {
        trace_id: TraceId,
        event_type: String,
        errors: Vec<FieldError>,
        rejected_at: DateTime<Utc>,
    },
    HandlerFaulted {
        trace_id: TraceId,
        event_type: String,
        agent_id: AgentId,
        reason: String,
        faulted_at: DateTime<Utc>,
    },
    NodeStateChanged {
        run_id: RunId,
        node: String,
        state: NodeState,
        changed_at: DateTime<Utc>,
    },
    RunFinished {
        run_id: RunId,
        state: RunState,
        finished_at: DateTime<Utc>,
    },
    SliceExpired {
        slice_id: String,
        expired_at: DateTime<Utc>,
    },
}
