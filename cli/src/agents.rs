// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Built-in demo agents
//!
//! `concord workflow run` executes against this closed set. An agent id
//! resolves to a kind through [`BUILTIN_AGENTS`], either exactly (`reviewer`)
//! or as a numbered instance (`reviewer-2`).

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use concord_core::domain::agent::{
    Agent, AgentError, AgentId, AgentStatusReport, AgentStatusTracker, HandledResult,
};
use concord_core::domain::events::event_types::{
    COMPLIANCE_CHECK, KNOWLEDGE_QUERY, SPECIFICATION_VALIDATE,
};
use concord_core::domain::events::{CanonicalEvent, DeliveredEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinKind {
    /// Checks `specification.validate` requests and approves non-empty capability lists.
    SemanticValidator,
    /// Answers `knowledge.query` with canned matches.
    KnowledgeRetriever,
    /// Evaluates `compliance.check` rule lists.
    ComplianceChecker,
    /// Executes any phase by echoing its input and upstream outputs.
    Worker,
    /// Approves any proposal that is not null.
    Reviewer,
}

pub const BUILTIN_AGENTS: &[(&str, BuiltinKind)] = &[
    ("semantic-validator", BuiltinKind::SemanticValidator),
    ("knowledge-retriever", BuiltinKind::KnowledgeRetriever),
    ("compliance-checker", BuiltinKind::ComplianceChecker),
    ("worker", BuiltinKind::Worker),
    ("reviewer", BuiltinKind::Reviewer),
];

impl BuiltinKind {
    pub fn resolve(agent_id: &str) -> Option<Self> {
        BUILTIN_AGENTS
            .iter()
            .find(|(name, _)| {
                agent_id == *name
                    || agent_id
                        .strip_prefix(name)
                        .and_then(|rest| rest.strip_prefix('-'))
                        .is_some_and(|suffix| !suffix.is_empty())
            })
            .map(|(_, kind)| *kind)
    }

    pub fn names() -> Vec<&'static str> {
        BUILTIN_AGENTS.iter().map(|(name, _)| *name).collect()
    }
}

pub struct BuiltinAgent {
    id: AgentId,
    kind: BuiltinKind,
    tracker: AgentStatusTracker,
}

impl BuiltinAgent {
    pub fn new(id: AgentId, kind: BuiltinKind) -> Self {
        Self {
            id,
            kind,
            tracker: AgentStatusTracker::new(),
        }
    }

    /// Instantiate the agent `id` names, if it names a built-in kind.
    pub fn for_id(id: &AgentId) -> Option<Arc<Self>> {
        BuiltinKind::resolve(id.as_str()).map(|kind| Arc::new(Self::new(id.clone(), kind)))
    }

    pub fn kind(&self) -> BuiltinKind {
        self.kind
    }

    fn execute_phase(&self, phase: &str, input: &Value, upstream: &serde_json::Map<String, Value>) -> HandledResult {
        let output = match self.kind {
            BuiltinKind::Worker | BuiltinKind::Reviewer => json!({
                "phase": phase,
                "agent": self.id.as_str(),
                "input": input,
                "upstream": upstream,
            }),
            BuiltinKind::SemanticValidator => json!({ "phase": phase, "validated": true }),
            BuiltinKind::KnowledgeRetriever => json!({ "phase": phase, "documents": upstream.len() }),
            BuiltinKind::ComplianceChecker => json!({ "phase": phase, "compliant": true }),
        };
        HandledResult::with_output(output)
    }
}

#[async_trait]
impl Agent for BuiltinAgent {
    fn id(&self) -> &AgentId {
        &self.id
    }

    fn capabilities(&self) -> Vec<String> {
        let capability = match self.kind {
            BuiltinKind::SemanticValidator => "validation",
            BuiltinKind::KnowledgeRetriever => "knowledge",
            BuiltinKind::ComplianceChecker => "compliance",
            BuiltinKind::Worker => "execution",
            BuiltinKind::Reviewer => "review",
        };
        vec![capability.to_string()]
    }

    fn subscriptions(&self) -> Vec<String> {
        match self.kind {
            BuiltinKind::SemanticValidator => vec![SPECIFICATION_VALIDATE.to_string()],
            BuiltinKind::KnowledgeRetriever => vec![KNOWLEDGE_QUERY.to_string()],
            BuiltinKind::ComplianceChecker => vec![COMPLIANCE_CHECK.to_string()],
            BuiltinKind::Worker | BuiltinKind::Reviewer => Vec::new(),
        }
    }

    async fn initialize(&self) -> Result<(), AgentError> {
        self.tracker.mark_ready();
        Ok(())
    }

    async fn handle_event(&self, event: &DeliveredEvent) -> Result<HandledResult, AgentError> {
        self.tracker.record_event(event);

        match &event.body {
            CanonicalEvent::PhaseExecute(request) => {
                Ok(self.execute_phase(&request.phase, &request.input, &request.upstream))
            }
            CanonicalEvent::VoteRequest(ballot) => Ok(if ballot.proposal.is_null() {
                HandledResult::reject()
            } else {
                HandledResult::approve()
            }),
            CanonicalEvent::SpecificationValidate(request) => {
                let valid = !request.specification.capabilities.is_empty();
                Ok(HandledResult {
                    output: json!({ "id": request.specification.id, "valid": valid }),
                    decision: None,
                })
            }
            CanonicalEvent::KnowledgeQuery(query) => {
                let hits: Vec<Value> = (0..query.limit.min(3))
                    .map(|i| json!({ "rank": i + 1, "title": format!("{} #{}", query.query, i + 1) }))
                    .collect();
                Ok(HandledResult::with_output(json!({ "results": hits })))
            }
            CanonicalEvent::ComplianceCheck(check) => Ok(HandledResult::with_output(json!({
                "subject": check.subject,
                "passed": check.rules,
                "strict": check.strict,
            }))),
            CanonicalEvent::ContextUpdate(_) | CanonicalEvent::ValidationFailed(_) => Ok(HandledResult::ack()),
            CanonicalEvent::Custom { event_type, .. } | CanonicalEvent::Unknown { event_type, .. } => {
                Err(AgentError::Unsupported(event_type.clone()))
            }
        }
    }

    fn status(&self) -> AgentStatusReport {
        self.tracker.report()
    }

    async fn shutdown(&self) {
        self.tracker.mark_stopped();
    }
}
