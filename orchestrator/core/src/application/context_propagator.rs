// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Context Propagator
//!
//! Owns every [`ContextSlice`] and delivers slices to agents as targeted
//! `context.update` events through the bus, so each delivery is validated like
//! any other event.
//!
//! Expiry is enforced lazily (on every read and before every delivery) and
//! eagerly by [`ContextPropagator::spawn_sweeper`]. When two slices share a
//! domain for the same agent, the higher priority wins and equal priorities
//! fall back to the later creation time.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::application::agent_registry::AgentRegistry;
use crate::domain::agent::AgentId;
use crate::domain::context::{
    ContextError, ContextSlice, ContextSliceInput, DeliveryFailure, PropagationMode,
    PropagationResult, Priority,
};
use crate::domain::events::event_types::CONTEXT_UPDATE;
use crate::domain::events::{ContextUpdate, CoordinationNotice, CorrelationId, TraceId};
use crate::infrastructure::event_bus::{DeliveryResult, EventBus, OutboundEvent, PublishStatus};

/// Slice currently holding a `(domain, agent)` pair.
#[derive(Debug, Clone, PartialEq)]
struct Claim {
    slice_id: String,
    priority: Priority,
    created_at: DateTime<Utc>,
}

type ClaimKey = (String, AgentId);

pub struct ContextPropagator {
    bus: Arc<EventBus>,
    registry: Arc<AgentRegistry>,
    slices: DashMap<String, ContextSlice>,
    claims: DashMap<ClaimKey, Claim>,
    default_ttl: Option<Duration>,
}

impl ContextPropagator {
    pub fn new(bus: Arc<EventBus>, registry: Arc<AgentRegistry>, default_ttl: Option<Duration>) -> Self {
        Self {
            bus,
            registry,
            slices: DashMap::new(),
            claims: DashMap::new(),
            default_ttl,
        }
    }

    pub fn create_slice(&self, input: ContextSliceInput) -> Result<ContextSlice, ContextError> {
        let id = input
            .id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ContextError::MissingField("id".to_string()))?;

        let slice = ContextSlice {
            id: id.clone(),
            owner_agent: input.owner_agent.unwrap_or_else(AgentId::runtime),
            domain: input.domain,
            state: input.state,
            priority: input.priority.unwrap_or_default(),
            ttl: input.ttl.or(self.default_ttl),
            metadata: input.metadata,
            created_at: Utc::now(),
        };

        match self.slices.entry(id.clone()) {
            Entry::Occupied(mut existing) => {
                if !existing.get().is_expired() {
                    return Err(ContextError::DuplicateId(id));
                }
                existing.insert(slice.clone());
            }
            Entry::Vacant(vacant) => {
                vacant.insert(slice.clone());
            }
        }

        debug!(slice_id = %slice.id, priority = ?slice.priority, ttl = ?slice.ttl, "Context slice created");
        Ok(slice)
    }

    /// Live slice by id; an expired slice is purged and reported as not found.
    pub fn get_slice(&self, id: &str) -> Result<ContextSlice, ContextError> {
        // Clone out so the shard lock is released before any purge.
        let slice = self
            .slices
            .get(id)
            .map(|s| s.value().clone())
            .ok_or_else(|| ContextError::NotFound(id.to_string()))?;

        if slice.is_expired() {
            self.purge(id);
            return Err(ContextError::NotFound(id.to_string()));
        }
        Ok(slice)
    }

    pub fn remove_slice(&self, id: &str) -> Result<ContextSlice, ContextError> {
        let (_, slice) = self
            .slices
            .remove(id)
            .ok_or_else(|| ContextError::NotFound(id.to_string()))?;
        self.claims.retain(|_, claim| claim.slice_id != id);
        Ok(slice)
    }

    pub fn len(&self) -> usize {
        self.slices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    pub async fn propagate(
        &self,
        slice_id: &str,
        mode: PropagationMode,
    ) -> Result<PropagationResult, ContextError> {
        self.propagate_with_trace(slice_id, mode, None, None).await
    }

    /// Deliver a slice, chaining every delivery onto an existing trace.
    pub async fn propagate_with_trace(
        &self,
        slice_id: &str,
        mode: PropagationMode,
        trace_id: Option<TraceId>,
        correlation_id: Option<CorrelationId>,
    ) -> Result<PropagationResult, ContextError> {
        let slice = self.get_slice(slice_id)?;
        let mut result = PropagationResult {
            slice_id: slice.id.clone(),
            ..PropagationResult::default()
        };

        for agent_id in self.recipients(&mode, &mut result) {
            if slice.is_expired() {
                result.expired.push(agent_id);
                continue;
            }

            let previous = match self.claim(&slice, &agent_id) {
                Ok(previous) => previous,
                Err(()) => {
                    debug!(slice_id = %slice.id, agent_id = %agent_id, "Delivery superseded");
                    result.superseded.push(agent_id);
                    continue;
                }
            };

            match self.deliver(&slice, &agent_id, trace_id, correlation_id).await {
                Ok(()) => result.delivered.push(agent_id),
                Err(reason) => {
                    self.release(&slice, &agent_id, previous);
                    result.failed.push(DeliveryFailure { agent_id, reason });
                }
            }
        }

        if !result.expired.is_empty() {
            self.purge(&slice.id);
        }

        debug!(
            slice_id = %slice.id,
            delivered = result.delivered.len(),
            superseded = result.superseded.len(),
            failed = result.failed.len(),
            expired = result.expired.len(),
            "Context slice propagated"
        );
        Ok(result)
    }

    /// Purge every expired slice; returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let expired: Vec<String> = self
            .slices
            .iter()
            .filter(|entry| entry.value().is_expired_at(now))
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for id in expired {
            if self
                .slices
                .remove_if(&id, |_, slice| slice.is_expired_at(now))
                .is_some()
            {
                self.claims.retain(|_, claim| claim.slice_id != id);
                self.notify_expired(&id);
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "Swept expired context slices");
        }
        removed
    }

    /// Run [`Self::sweep_expired`] every `interval` until `token` is cancelled.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, token: CancellationToken) -> JoinHandle<()> {
        let propagator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        propagator.sweep_expired();
                    }
                }
            }
            info!("Context sweeper stopped");
        })
    }

    fn recipients(&self, mode: &PropagationMode, result: &mut PropagationResult) -> Vec<AgentId> {
        match mode {
            PropagationMode::Broadcast => self.registry.ids(),
            PropagationMode::Targeted { agents } => agents
                .iter()
                .filter(|agent| {
                    let known = self.registry.contains(agent);
                    if !known {
                        result.failed.push(DeliveryFailure {
                            agent_id: (*agent).clone(),
                            reason: "agent not registered".to_string(),
                        });
                    }
                    known
                })
                .cloned()
                .collect(),
            PropagationMode::Filtered { filter } => self
                .registry
                .descriptors()
                .into_iter()
                .filter(|d| filter.matches(d))
                .map(|d| d.id)
                .collect(),
        }
    }

    /// Take the `(domain, agent)` claim for `slice`, returning the claim it
    /// replaced. `Err` means a live, higher-ranked slice holds it.
    fn claim(&self, slice: &ContextSlice, agent_id: &AgentId) -> Result<Option<Claim>, ()> {
        let Some(domain) = &slice.domain else {
            return Ok(None);
        };
        let ours = Claim {
            slice_id: slice.id.clone(),
            priority: slice.priority,
            created_at: slice.created_at,
        };

        match self.claims.entry((domain.clone(), agent_id.clone())) {
            Entry::Vacant(vacant) => {
                vacant.insert(ours);
                Ok(None)
            }
            Entry::Occupied(mut occupied) => {
                let current = occupied.get().clone();
                let holder_alive = current.slice_id != slice.id && self.is_live(&current.slice_id);
                if holder_alive && !slice.supersedes(current.priority, current.created_at) {
                    return Err(());
                }
                occupied.insert(ours);
                Ok(Some(current))
            }
        }
    }

    /// Undo a claim taken for a delivery that failed.
    fn release(&self, slice: &ContextSlice, agent_id: &AgentId, previous: Option<Claim>) {
        let Some(domain) = &slice.domain else {
            return;
        };
        let key = (domain.clone(), agent_id.clone());
        if let Entry::Occupied(mut occupied) = self.claims.entry(key) {
            if occupied.get().slice_id != slice.id {
                return;
            }
            match previous {
                Some(previous) => {
                    occupied.insert(previous);
                }
                None => {
                    occupied.remove();
                }
            }
        }
    }

    fn is_live(&self, slice_id: &str) -> bool {
        self.slices
            .get(slice_id)
            .map(|s| !s.is_expired())
            .unwrap_or(false)
    }

    async fn deliver(
        &self,
        slice: &ContextSlice,
        agent_id: &AgentId,
        trace_id: Option<TraceId>,
        correlation_id: Option<CorrelationId>,
    ) -> Result<(), String> {
        let update = ContextUpdate {
            slice_id: slice.id.clone(),
            owner_agent: slice.owner_agent.clone(),
            priority: slice.priority,
            domain: slice.domain.clone(),
            state: slice.state.clone(),
            metadata: slice.metadata.clone(),
            expires_at: slice.expires_at(),
        };
        let payload = serde_json::to_value(&update).map_err(|e| e.to_string())?;

        let mut outbound = OutboundEvent::new(CONTEXT_UPDATE, payload, slice.owner_agent.clone())
            .to_agent(agent_id.clone());
        outbound.trace_id = trace_id;
        outbound.correlation_id = correlation_id;

        let receipt = self.bus.dispatch(outbound).await;
        match &receipt.status {
            PublishStatus::Rejected { errors } => Err(errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ")),
            PublishStatus::Delivered { .. } => match receipt.delivery_to(agent_id) {
                None => Err("agent not subscribed to context updates".to_string()),
                Some(outcome) => match &outcome.result {
                    DeliveryResult::Handled(_) => Ok(()),
                    DeliveryResult::Faulted { reason } => Err(reason.clone()),
                },
            },
        }
    }

    fn purge(&self, id: &str) {
        if self
            .slices
            .remove_if(id, |_, slice| slice.is_expired())
            .is_some()
        {
            self.claims.retain(|_, claim| claim.slice_id != id);
            self.notify_expired(id);
        }
    }

    fn notify_expired(&self, id: &str) {
        debug!(slice_id = %id, "Context slice expired");
        self.bus.notify(CoordinationNotice::SliceExpired {
            slice_id: id.to_string(),
            expired_at: Utc::now(),
        });
    }
}
