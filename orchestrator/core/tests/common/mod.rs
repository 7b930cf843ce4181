// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Shared mock agents for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use concord_core::domain::agent::{
    Agent, AgentError, AgentId, AgentStatusReport, AgentStatusTracker, HandledResult,
};
use concord_core::domain::events::{CanonicalEvent, DeliveredEvent};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// How a [`MockAgent`] answers a `workflow.phase.execute`.
#[derive(Debug, Clone)]
pub enum PhaseScript {
    Output { output: Value, delay: Duration },
    Fail(String),
    Decline,
    Hang,
}

/// How a [`MockAgent`] answers a `consensus.vote.request`.
#[derive(Debug, Clone, Copy)]
pub enum VoteScript {
    Approve(Duration),
    Reject(Duration),
    Silent,
}

/// How a [`MockAgent`] answers a `context.update`.
#[derive(Debug, Clone, Copy)]
pub enum ContextScript {
    Ack,
    Hang,
}

/// One `workflow.phase.execute` seen by an agent.
#[derive(Debug, Clone)]
pub struct PhaseCall {
    pub phase: String,
    pub upstream: serde_json::Map<String, Value>,
    pub started: Instant,
    pub finished: Instant,
}

pub struct MockAgent {
    id: AgentId,
    extra_subscriptions: Vec<String>,
    capabilities: Vec<String>,
    phases: HashMap<String, PhaseScript>,
    default_phase: PhaseScript,
    vote: VoteScript,
    context: ContextScript,
    tracker: AgentStatusTracker,
    pub received: Mutex<Vec<DeliveredEvent>>,
    pub phase_calls: Mutex<Vec<PhaseCall>>,
}

impl MockAgent {
    pub fn new(id: &str) -> Self {
        Self {
            id: AgentId::new(id),
            extra_subscriptions: Vec::new(),
            capabilities: Vec::new(),
            phases: HashMap::new(),
            default_phase: PhaseScript::Output {
                output: json!({ "by": id }),
                delay: Duration::ZERO,
            },
            vote: VoteScript::Approve(Duration::ZERO),
            context: ContextScript::Ack,
            tracker: AgentStatusTracker::new(),
            received: Mutex::new(Vec::new()),
            phase_calls: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribed_to(mut self, event_type: &str) -> Self {
        self.extra_subscriptions.push(event_type.to_string());
        self
    }

    pub fn with_capability(mut self, capability: &str) -> Self {
        self.capabilities.push(capability.to_string());
        self
    }

    pub fn on_phase(mut self, phase: &str, script: PhaseScript) -> Self {
        self.phases.insert(phase.to_string(), script);
        self
    }

    pub fn phase_delay(mut self, delay: Duration) -> Self {
        if let PhaseScript::Output { delay: d, .. } = &mut self.default_phase {
            *d = delay;
        }
        self
    }

    pub fn voting(mut self, vote: VoteScript) -> Self {
        self.vote = vote;
        self
    }

    pub fn on_context(mut self, context: ContextScript) -> Self {
        self.context = context;
        self
    }

    pub fn arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn received_types(&self) -> Vec<String> {
        self.received
            .lock()
            .iter()
            .map(|e| e.canonical_type().to_string())
            .collect()
    }

    pub fn count_of(&self, event_type: &str) -> usize {
        self.received
            .lock()
            .iter()
            .filter(|e| e.canonical_type() == event_type)
            .count()
    }

    /// `phase` metadata of every context slice handed to this agent, in arrival order.
    pub fn context_phases(&self) -> Vec<String> {
        self.received
            .lock()
            .iter()
            .filter_map(|e| match &e.body {
                CanonicalEvent::ContextUpdate(update) => update
                    .metadata
                    .get("phase")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                _ => None,
            })
            .collect()
    }

    pub fn phase_call(&self, phase: &str) -> Option<PhaseCall> {
        self.phase_calls.lock().iter().find(|c| c.phase == phase).cloned()
    }

    async fn run_phase(&self, phase: &str, upstream: serde_json::Map<String, Value>) -> Result<HandledResult, AgentError> {
        let started = Instant::now();
        let script = self.phases.get(phase).cloned().unwrap_or_else(|| self.default_phase.clone());
        let result = match script {
            PhaseScript::Output { output, delay } => {
                tokio::time::sleep(delay).await;
                Ok(HandledResult::with_output(output))
            }
            PhaseScript::Fail(reason) => Err(AgentError::Handler(reason)),
            PhaseScript::Decline => Ok(HandledResult::reject()),
            PhaseScript::Hang => {
                std::future::pending::<()>().await;
                Ok(HandledResult::ack())
            }
        };
        self.phase_calls.lock().push(PhaseCall {
            phase: phase.to_string(),
            upstream,
            started,
            finished: Instant::now(),
        });
        result
    }

    async fn cast_vote(&self) -> HandledResult {
        match self.vote {
            VoteScript::Approve(delay) => {
                tokio::time::sleep(delay).await;
                HandledResult::approve()
            }
            VoteScript::Reject(delay) => {
                tokio::time::sleep(delay).await;
                HandledResult::reject()
            }
            VoteScript::Silent => {
                std::future::pending::<()>().await;
                HandledResult::ack()
            }
        }
    }
}

#[async_trait]
impl Agent for MockAgent {
    fn id(&self) -> &AgentId {
        &self.id
    }

    fn capabilities(&self) -> Vec<String> {
        self.capabilities.clone()
    }

    fn subscriptions(&self) -> Vec<String> {
        self.extra_subscriptions.clone()
    }

    async fn initialize(&self) -> Result<(), AgentError> {
        self.tracker.mark_ready();
        Ok(())
    }

    async fn handle_event(&self, event: &DeliveredEvent) -> Result<HandledResult, AgentError> {
        self.tracker.record_event(event);
        self.received.lock().push(event.clone());

        match &event.body {
            CanonicalEvent::PhaseExecute(request) => {
                self.run_phase(&request.phase, request.upstream.clone()).await
            }
            CanonicalEvent::VoteRequest(_) => Ok(self.cast_vote().await),
            CanonicalEvent::ContextUpdate(_) => match self.context {
                ContextScript::Ack => Ok(HandledResult::ack()),
                ContextScript::Hang => {
                    std::future::pending::<()>().await;
                    Ok(HandledResult::ack())
                }
            },
            CanonicalEvent::SpecificationValidate(_)
            | CanonicalEvent::KnowledgeQuery(_)
            | CanonicalEvent::ComplianceCheck(_)
            | CanonicalEvent::ValidationFailed(_)
            | CanonicalEvent::Custom { .. }
            | CanonicalEvent::Unknown { .. } => Ok(HandledResult::ack()),
        }
    }

    fn status(&self) -> AgentStatusReport {
        self.tracker.report()
    }

    async fn shutdown(&self) {
        self.tracker.mark_stopped();
    }
}
