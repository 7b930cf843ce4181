// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Consensus Gate
//!
//! Sends a `consensus.vote.request` to every required agent at once and
//! counts approvals in arrival order. Collection stops as soon as the
//! threshold is met, becomes unreachable, the deadline passes, or the run is
//! cancelled. Votes arriving after that are dropped.

use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::agent::AgentId;
use crate::domain::consensus::{ConsensusRequest, ConsensusResult, ConsensusTally, Vote};
use crate::domain::events::event_types::VOTE_REQUEST;
use crate::domain::events::{CorrelationId, TraceId, VoteRequest};
use crate::infrastructure::event_bus::{EventBus, OutboundEvent};

/// What the voters are asked to approve.
#[derive(Debug, Clone)]
pub struct Ballot {
    pub run_id: String,
    pub phase: String,
    pub proposal: Value,
    pub trace_id: Option<TraceId>,
    pub correlation_id: Option<CorrelationId>,
}

impl Ballot {
    pub fn new(run_id: impl Into<String>, phase: impl Into<String>, proposal: Value) -> Self {
        Self {
            run_id: run_id.into(),
            phase: phase.into(),
            proposal,
            trace_id: None,
            correlation_id: None,
        }
    }
}

pub struct ConsensusGate {
    bus: Arc<EventBus>,
}

impl ConsensusGate {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }

    pub async fn collect(
        &self,
        request: &ConsensusRequest,
        ballot: &Ballot,
        cancel: &CancellationToken,
    ) -> ConsensusResult {
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + request.timeout;
        let mut tally = ConsensusTally::new(request);

        let vote_request = VoteRequest {
            run_id: ballot.run_id.clone(),
            phase: ballot.phase.clone(),
            threshold: request.threshold as u64,
            required_agents: request.required_agents.iter().cloned().collect(),
            proposal: ballot.proposal.clone(),
        };
        let payload = match serde_json::to_value(&vote_request) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(run_id = %ballot.run_id, phase = %ballot.phase, error = %e, "Could not encode vote request");
                return tally.into_result(started.elapsed(), false, false);
            }
        };

        let mut pending: FuturesUnordered<_> = request
            .required_agents
            .iter()
            .cloned()
            .map(|agent| self.ask(agent, payload.clone(), ballot))
            .collect();

        let sleep = tokio::time::sleep_until(deadline);
        tokio::pin!(sleep);

        let mut timed_out = false;
        let mut abandoned = false;
        while !tally.is_reached() && !tally.is_unreachable() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    abandoned = true;
                    break;
                }
                _ = &mut sleep => {
                    timed_out = true;
                    break;
                }
                next = pending.next() => match next {
                    Some((agent, vote)) => {
                        debug!(phase = %ballot.phase, agent_id = %agent, vote = ?vote, "Vote received");
                        tally.record(agent, vote);
                    }
                    None => break,
                },
            }
        }
        drop(pending);

        let result = tally.into_result(started.elapsed(), timed_out, abandoned);
        metrics::counter!("concord_consensus_total", "reached" => result.reached.to_string())
            .increment(1);
        info!(
            run_id = %ballot.run_id,
            phase = %ballot.phase,
            reached = result.reached,
            approvals = result.approvals.len(),
            threshold = request.threshold,
            timed_out = result.timed_out,
            "Consensus gate resolved"
        );
        result
    }

    async fn ask(&self, agent: AgentId, payload: Value, ballot: &Ballot) -> (AgentId, Vote) {
        let mut outbound = OutboundEvent::new(VOTE_REQUEST, payload, AgentId::runtime())
            .to_agent(agent.clone());
        outbound.trace_id = ballot.trace_id;
        outbound.correlation_id = ballot.correlation_id;

        let receipt = self.bus.dispatch(outbound).await;
        let decision = receipt
            .delivery_to(&agent)
            .and_then(|d| d.handled())
            .and_then(|handled| handled.decision);
        (agent, Vote::from(decision))
    }
}
