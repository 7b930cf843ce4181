// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Context Slices
//!
//! A [`ContextSlice`] is a scoped, TTL-bounded bundle of shared state that the
//! [`ContextPropagator`](crate::application::context_propagator::ContextPropagator)
//! delivers to agents. Once its TTL elapses a slice is treated as absent,
//! whether or not it was ever delivered.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::domain::agent::{AgentDescriptor, AgentHealth, AgentId, AgentLifecycleStatus};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl FromStr for Priority {
    type Err = ContextError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            other => Err(ContextError::InvalidField {
                field: "priority".to_string(),
                reason: format!("unknown priority '{}'", other),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSlice {
    pub id: String,
    pub owner_agent: AgentId,
    pub domain: Option<String>,
    pub state: Option<Value>,
    pub priority: Priority,
    #[serde(default, with = "humantime_serde")]
    pub ttl: Option<Duration>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl ContextSlice {
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let ttl = self.ttl?;
        let at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|d| self.created_at.checked_add_signed(d));
        Some(at.unwrap_or(DateTime::<Utc>::MAX_UTC))
    }

    /// A slice with `ttl = 0` is expired from the instant it is created.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().map(|at| now >= at).unwrap_or(false)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Conflict rule on a shared `(domain, agent)`: higher priority wins,
    /// equal priority falls back to the later timestamp.
    pub fn supersedes(&self, priority: Priority, created_at: DateTime<Utc>) -> bool {
        self.priority > priority || (self.priority == priority && self.created_at >= created_at)
    }
}

/// Input to slice creation. Everything except `id` is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextSliceInput {
    pub id: Option<String>,
    pub owner_agent: Option<AgentId>,
    pub domain: Option<String>,
    pub state: Option<Value>,
    pub priority: Option<Priority>,
    #[serde(default, with = "humantime_serde")]
    pub ttl: Option<Duration>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl ContextSliceInput {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    pub fn owner(mut self, owner: AgentId) -> Self {
        self.owner_agent = Some(owner);
        self
    }

    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn state(mut self, state: Value) -> Self {
        self.state = Some(state);
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Predicate over registered agents used by [`PropagationMode::Filtered`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentFilter {
    pub capability: Option<String>,
    pub health: Option<AgentHealth>,
    pub status: Option<AgentLifecycleStatus>,
}

impl AgentFilter {
    pub fn with_capability(capability: impl Into<String>) -> Self {
        Self {
            capability: Some(capability.into()),
            ..Self::default()
        }
    }

    pub fn healthy(mut self) -> Self {
        self.health = Some(AgentHealth::Healthy);
        self
    }

    pub fn ready(mut self) -> Self {
        self.status = Some(AgentLifecycleStatus::Ready);
        self
    }

    pub fn matches(&self, agent: &AgentDescriptor) -> bool {
        self.capability
            .as_deref()
            .map(|c| agent.has_capability(c))
            .unwrap_or(true)
            && self.health.map(|h| agent.status.health == h).unwrap_or(true)
            && self.status.map(|s| agent.status.status == s).unwrap_or(true)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum PropagationMode {
    /// Every registered agent.
    Broadcast,
    /// An explicit agent set.
    Targeted { agents: BTreeSet<AgentId> },
    /// Agents whose descriptor matches the filter.
    Filtered { filter: AgentFilter },
}

impl PropagationMode {
    pub fn targeted<I, A>(agents: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<AgentId>,
    {
        Self::Targeted {
            agents: agents.into_iter().map(Into::into).collect(),
        }
    }

    pub fn filtered(filter: AgentFilter) -> Self {
        Self::Filtered { filter }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryFailure {
    pub agent_id: AgentId,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PropagationResult {
    pub slice_id: String,
    pub delivered: Vec<AgentId>,
    /// Agents already holding a higher-ranked slice for the same domain.
    pub superseded: Vec<AgentId>,
    pub failed: Vec<DeliveryFailure>,
    /// Agents skipped because the slice expired while propagation was in flight.
    pub expired: Vec<AgentId>,
}

impl PropagationResult {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.expired.is_empty()
    }
}

#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
pub enum ContextError {
    #[error("Context slice is missing required field '{0}'")]
    MissingField(String),

    #[error("Invalid context field '{field}': {reason}")]
    InvalidField { field: String, reason: String },

    #[error("Context slice '{0}' not found")]
    NotFound(String),

    #[error("Context slice '{0}' already exists")]
    DuplicateId(String),
}
