// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Agent Contract
//!
//! Every agent plugged into the runtime implements [`Agent`]. The core never
//! looks inside an agent; it only delivers validated events, reads status
//! reports and drives the `initialize` / `shutdown` lifecycle.
//!
//! Agents receive a [`DeliveredEvent`] whose `body` is a [`CanonicalEvent`]
//! and dispatch with an exhaustive `match`:
//!
//! ```ignore
//! match &event.body {
//!     CanonicalEvent::PhaseExecute(phase) => { /* ... */ }
//!     CanonicalEvent::VoteRequest(_) => Ok(HandledResult::approve()),
//!     _ => Ok(HandledResult::ack()),
//! }
//! ```
//!
//! [`CanonicalEvent`]: crate::domain::events::CanonicalEvent

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::domain::events::{DeliveredEvent, TraceId};

/// Stable, human-assigned agent identifier (e.g. `"semantic-validator"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identity used by the runtime itself when it is the event source.
    pub fn runtime() -> Self {
        Self("concord.runtime".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for AgentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentLifecycleStatus {
    Registered,
    Ready,
    Failed,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentHealth {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Most recent event an agent handled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastEvent {
    pub event_type: String,
    pub trace_id: TraceId,
    pub handled_at: DateTime<Utc>,
}

/// Snapshot returned by [`Agent::status`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStatusReport {
    pub status: AgentLifecycleStatus,
    pub health: AgentHealth,
    pub last_event: Option<LastEvent>,
    #[serde(with = "humantime_serde")]
    pub uptime: Duration,
}

/// An agent's verdict when asked to vote or to accept a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Approve,
    Reject,
}

/// Successful outcome of [`Agent::handle_event`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandledResult {
    #[serde(default)]
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<Decision>,
}

impl HandledResult {
    /// Plain acknowledgement with no output and no decision.
    pub fn ack() -> Self {
        Self {
            output: Value::Null,
            decision: None,
        }
    }

    pub fn with_output(output: Value) -> Self {
        Self {
            output,
            decision: None,
        }
    }

    pub fn approve() -> Self {
        Self {
            output: Value::Null,
            decision: Some(Decision::Approve),
        }
    }

    pub fn reject() -> Self {
        Self {
            output: Value::Null,
            decision: Some(Decision::Reject),
        }
    }

    pub fn is_approval(&self) -> bool {
        self.decision == Some(Decision::Approve)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
pub enum AgentError {
    #[error("Agent initialization failed: {0}")]
    Init(String),

    #[error("Agent failed to handle event: {0}")]
    Handler(String),

    #[error("Agent does not handle event type '{0}'")]
    Unsupported(String),
}

/// Uniform interface implemented by every agent.
#[async_trait]
pub trait Agent: Send + Sync {
    fn id(&self) -> &AgentId;

    /// Capability tags consulted by filtered context propagation.
    fn capabilities(&self) -> Vec<String> {
        Vec::new()
    }

    /// Canonical event types this agent wants beyond the runtime's own
    /// (context updates, phase execution, vote requests).
    fn subscriptions(&self) -> Vec<String> {
        Vec::new()
    }

    async fn initialize(&self) -> Result<(), AgentError>;

    async fn handle_event(&self, event: &DeliveredEvent) -> Result<HandledResult, AgentError>;

    fn status(&self) -> AgentStatusReport;

    async fn shutdown(&self);
}

/// Registry view of an agent used for filtering and status listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub id: AgentId,
    pub capabilities: Vec<String>,
    pub status: AgentStatusReport,
}

impl AgentDescriptor {
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }
}

/// Status bookkeeping that agent implementations can embed.
#[derive(Debug)]
pub struct AgentStatusTracker {
    inner: Mutex<TrackerState>,
}

#[derive(Debug)]
struct TrackerState {
    status: AgentLifecycleStatus,
    health: AgentHealth,
    last_event: Option<LastEvent>,
    ready_since: Option<Instant>,
}

impl AgentStatusTracker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TrackerState {
                status: AgentLifecycleStatus::Registered,
                health: AgentHealth::Healthy,
                last_event: None,
                ready_since: None,
            }),
        }
    }

    pub fn mark_ready(&self) {
        let mut state = self.inner.lock();
        state.status = AgentLifecycleStatus::Ready;
        state.ready_since.get_or_insert_with(Instant::now);
    }

    pub fn mark_failed(&self) {
        let mut state = self.inner.lock();
        state.status = AgentLifecycleStatus::Failed;
        state.health = AgentHealth::Unhealthy;
    }

    pub fn mark_stopped(&self) {
        let mut state = self.inner.lock();
        state.status = AgentLifecycleStatus::Stopped;
        state.ready_since = None;
    }

    pub fn set_health(&self, health: AgentHealth) {
        self.inner.lock().health = health;
    }

    pub fn record_event(&self, event: &DeliveredEvent) {
        self.inner.lock().last_event = Some(LastEvent {
            event_type: event.canonical_type().to_string(),
            trace_id: event.trace_id(),
            handled_at: Utc::now(),
        });
    }

    pub fn report(&self) -> AgentStatusReport {
        let state = self.inner.lock();
        AgentStatusReport {
            status: state.status,
            health: state.health,
            last_event: state.last_event.clone(),
            uptime: state.ready_since.map(|t| t.elapsed()).unwrap_or_default(),
        }
    }
}

impl Default for AgentStatusTracker {
    fn default() -> Self {
        Self::new()
    }
}
