// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Consensus Gates
//!
//! A [`ConsensusRequest`] asks a set of agents for approval; it is reached
//! once `threshold` distinct required agents approve before the deadline.
//! [`ConsensusTally`] is the pure counting core used by the gate service.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use thiserror::Error;

use crate::domain::agent::{AgentId, Decision};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusRequest {
    pub required_agents: BTreeSet<AgentId>,
    pub threshold: usize,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl ConsensusRequest {
    pub fn new<I, A>(required_agents: I, threshold: usize, timeout: Duration) -> Result<Self, ConsensusError>
    where
        I: IntoIterator<Item = A>,
        A: Into<AgentId>,
    {
        let required_agents: BTreeSet<AgentId> = required_agents.into_iter().map(Into::into).collect();
        if required_agents.is_empty() {
            return Err(ConsensusError::NoAgents);
        }
        if threshold == 0 {
            return Err(ConsensusError::ZeroThreshold);
        }
        if threshold > required_agents.len() {
            return Err(ConsensusError::ThresholdExceedsAgents {
                threshold,
                agents: required_agents.len(),
            });
        }
        Ok(Self {
            required_agents,
            threshold,
            timeout,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusResult {
    /// Approving agents in arrival order.
    pub approvals: Vec<AgentId>,
    pub rejections: Vec<AgentId>,
    pub reached: bool,
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
    /// Deadline passed before the threshold was met.
    pub timed_out: bool,
    /// Collection was cancelled with the run.
    pub abandoned: bool,
}

impl ConsensusResult {
    pub fn approved_by(&self, agent: &AgentId) -> bool {
        self.approvals.contains(agent)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsensusError {
    #[error("Consensus request needs at least one required agent")]
    NoAgents,

    #[error("Consensus threshold must be at least 1")]
    ZeroThreshold,

    #[error("Consensus threshold {threshold} exceeds the {agents} required agents")]
    ThresholdExceedsAgents { threshold: usize, agents: usize },
}

/// Vote as observed by the gate. Anything other than an explicit approval
/// (rejection, fault, no decision) counts as a non-approving response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vote {
    Approve,
    Reject,
    Abstain,
}

impl From<Option<Decision>> for Vote {
    fn from(decision: Option<Decision>) -> Self {
        match decision {
            Some(Decision::Approve) => Vote::Approve,
            Some(Decision::Reject) => Vote::Reject,
            None => Vote::Abstain,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConsensusTally {
    required: BTreeSet<AgentId>,
    threshold: usize,
    responded: BTreeSet<AgentId>,
    approvals: Vec<AgentId>,
    rejections: Vec<AgentId>,
}

impl ConsensusTally {
    pub fn new(request: &ConsensusRequest) -> Self {
        Self {
            required: request.required_agents.clone(),
            threshold: request.threshold,
            responded: BTreeSet::new(),
            approvals: Vec::new(),
            rejections: Vec::new(),
        }
    }

    /// Record one response. Votes from agents outside the required set and
    /// repeated votes are ignored.
    pub fn record(&mut self, agent: AgentId, vote: Vote) -> bool {
        if !self.required.contains(&agent) || !self.responded.insert(agent.clone()) {
            return false;
        }
        match vote {
            Vote::Approve => self.approvals.push(agent),
            Vote::Reject => self.rejections.push(agent),
            Vote::Abstain => {}
        }
        true
    }

    pub fn is_reached(&self) -> bool {
        self.approvals.len() >= self.threshold
    }

    /// True when even unanimous approval from the agents still outstanding
    /// cannot meet the threshold.
    pub fn is_unreachable(&self) -> bool {
        let outstanding = self.required.len() - self.responded.len();
        self.approvals.len() + outstanding < self.threshold
    }

    pub fn into_result(self, elapsed: Duration, timed_out: bool, abandoned: bool) -> ConsensusResult {
        let reached = !abandoned && self.is_reached();
        ConsensusResult {
            approvals: self.approvals,
            rejections: self.rejections,
            reached,
            elapsed,
            timed_out: timed_out && !reached,
            abandoned,
        }
    }
}
