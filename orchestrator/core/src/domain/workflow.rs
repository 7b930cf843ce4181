// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Workflow Domain Model
//!
//! Workflows are dependency graphs of phases. Each phase is executed by one
//! agent; a phase may additionally require a consensus gate before it counts
//! as completed.
//!
//! # Design Principles
//!
//! 1. **Validated once:** [`Dag::build`] rejects malformed graphs before any node runs
//! 2. **Single writer:** a [`DagRun`] is mutated only by the orchestrator's coordinator task
//! 3. **Explicit transitions:** node state changes go through guarded methods

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Borrow;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::agent::AgentId;
use crate::domain::consensus::{ConsensusError, ConsensusRequest, ConsensusResult};
use crate::domain::context::Priority;
use crate::domain::schema::FieldError;

// ============================================================================
// Value Objects: Identifiers
// ============================================================================

/// Unique identifier for one execution of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique name of a phase within a workflow (e.g. `"analyze"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PhaseName(String);

impl PhaseName {
    /// Names must be non-empty and free of whitespace.
    pub fn new(name: impl Into<String>) -> Result<Self, WorkflowError> {
        let name = name.into();
        if name.is_empty() || name.chars().any(char::is_whitespace) {
            return Err(WorkflowError::InvalidPhaseName(name));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for PhaseName {
    type Error = WorkflowError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<PhaseName> for String {
    fn from(name: PhaseName) -> Self {
        name.0
    }
}

impl Borrow<str> for PhaseName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PhaseName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Definition
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Nothing new starts after a failure; pending nodes are skipped.
    #[default]
    AbortDependents,
    /// Only descendants of a failed node are skipped.
    ContinueIndependent,
}

/// Quorum required before a phase counts as completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusSpec {
    pub required_agents: Vec<AgentId>,
    pub threshold: usize,
    /// Falls back to the orchestrator's configured consensus timeout.
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
}

impl ConsensusSpec {
    pub fn to_request(&self, default_timeout: Duration) -> Result<ConsensusRequest, ConsensusError> {
        ConsensusRequest::new(
            self.required_agents.iter().cloned(),
            self.threshold,
            self.timeout.unwrap_or(default_timeout),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseDefinition {
    pub name: PhaseName,
    pub agent: AgentId,
    /// Falls back to the orchestrator's configured node timeout.
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub consensus: Option<ConsensusSpec>,
    /// Priority of the context slice handed to the phase's agent.
    #[serde(default)]
    pub priority: Priority,
}

impl PhaseDefinition {
    pub fn new(name: PhaseName, agent: impl Into<AgentId>) -> Self {
        Self {
            name,
            agent: agent.into(),
            timeout: None,
            consensus: None,
            priority: Priority::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_consensus(mut self, consensus: ConsensusSpec) -> Self {
        self.consensus = Some(consensus);
        self
    }
}

/// Edge `from → to`: `to` may start only after `from` completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub from: PhaseName,
    pub to: PhaseName,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    pub phases: Vec<PhaseDefinition>,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    #[serde(default)]
    pub policy: Option<FailurePolicy>,
    #[serde(default)]
    pub max_concurrency: Option<usize>,
}

// ============================================================================
// Validated graph
// ============================================================================

/// Validated, acyclic workflow graph.
///
/// # Invariants
/// - At least one phase, all names unique
/// - Every dependency endpoint names a declared phase
/// - Every consensus gate has a satisfiable threshold
/// - No cycles
#[derive(Debug, Clone)]
pub struct Dag {
    definition: WorkflowDefinition,
    index: HashMap<PhaseName, usize>,
    order: Vec<PhaseName>,
    upstream: HashMap<PhaseName, BTreeSet<PhaseName>>,
    downstream: HashMap<PhaseName, BTreeSet<PhaseName>>,
}

impl Dag {
    pub fn build(definition: WorkflowDefinition) -> Result<Self, WorkflowError> {
        if definition.phases.is_empty() {
            return Err(WorkflowError::NoPhases);
        }
        if definition.max_concurrency == Some(0) {
            return Err(WorkflowError::InvalidConcurrency);
        }

        let mut index = HashMap::new();
        for (position, phase) in definition.phases.iter().enumerate() {
            if index.insert(phase.name.clone(), position).is_some() {
                return Err(WorkflowError::DuplicatePhase(phase.name.to_string()));
            }
            if let Some(consensus) = &phase.consensus {
                consensus
                    .to_request(Duration::ZERO)
                    .map_err(|source| WorkflowError::InvalidConsensus {
                        phase: phase.name.to_string(),
                        source,
                    })?;
            }
        }

        let mut upstream: HashMap<PhaseName, BTreeSet<PhaseName>> = HashMap::new();
        let mut downstream: HashMap<PhaseName, BTreeSet<PhaseName>> = HashMap::new();
        for phase in &definition.phases {
            upstream.insert(phase.name.clone(), BTreeSet::new());
            downstream.insert(phase.name.clone(), BTreeSet::new());
        }
        for edge in &definition.dependencies {
            if !index.contains_key(&edge.from) || !index.contains_key(&edge.to) {
                return Err(WorkflowError::UnknownDependency {
                    from: edge.from.to_string(),
                    to: edge.to.to_string(),
                });
            }
            upstream.entry(edge.to.clone()).or_default().insert(edge.from.clone());
            downstream.entry(edge.from.clone()).or_default().insert(edge.to.clone());
        }

        let order = topological_order(&definition, &upstream, &downstream)?;

        Ok(Self {
            definition,
            index,
            order,
            upstream,
            downstream,
        })
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn definition(&self) -> &WorkflowDefinition {
        &self.definition
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn phase(&self, name: &str) -> Option<&PhaseDefinition> {
        self.index.get(name).map(|&i| &self.definition.phases[i])
    }

    /// Phases in a valid execution order (declaration order breaks ties).
    pub fn topological_order(&self) -> &[PhaseName] {
        &self.order
    }

    pub fn dependencies_of(&self, name: &str) -> impl Iterator<Item = &PhaseName> {
        self.upstream.get(name).into_iter().flatten()
    }

    pub fn dependents_of(&self, name: &str) -> impl Iterator<Item = &PhaseName> {
        self.downstream.get(name).into_iter().flatten()
    }

    /// Every phase transitively downstream of `name`.
    pub fn descendants_of(&self, name: &str) -> BTreeSet<PhaseName> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<&PhaseName> = self.dependents_of(name).collect();
        while let Some(next) = queue.pop_front() {
            if seen.insert(next.clone()) {
                queue.extend(self.dependents_of(next.as_str()));
            }
        }
        seen
    }

    /// Every agent the workflow talks to, including consensus voters.
    pub fn agents(&self) -> BTreeSet<AgentId> {
        let mut agents = BTreeSet::new();
        for phase in &self.definition.phases {
            agents.insert(phase.agent.clone());
            if let Some(consensus) = &phase.consensus {
                agents.extend(consensus.required_agents.iter().cloned());
            }
        }
        agents
    }
}

/// Kahn's algorithm. On failure, reports exactly the phases lying on a cycle
/// (phases merely downstream of a cycle are left out).
fn topological_order(
    definition: &WorkflowDefinition,
    upstream: &HashMap<PhaseName, BTreeSet<PhaseName>>,
    downstream: &HashMap<PhaseName, BTreeSet<PhaseName>>,
) -> Result<Vec<PhaseName>, WorkflowError> {
    let mut in_degree: HashMap<&PhaseName, usize> = upstream
        .iter()
        .map(|(name, deps)| (name, deps.len()))
        .collect();

    let mut ready: VecDeque<&PhaseName> = definition
        .phases
        .iter()
        .map(|p| &p.name)
        .filter(|name| in_degree.get(name).copied() == Some(0))
        .collect();

    let mut order = Vec::with_capacity(definition.phases.len());
    while let Some(name) = ready.pop_front() {
        order.push(name.clone());
        for next in downstream.get(name).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(next) {
                *degree -= 1;
                if *degree == 0 {
                    ready.push_back(next);
                }
            }
        }
    }

    if order.len() == definition.phases.len() {
        return Ok(order);
    }

    let placed: HashSet<&PhaseName> = order.iter().collect();
    let remaining: HashSet<&PhaseName> = definition
        .phases
        .iter()
        .map(|p| &p.name)
        .filter(|name| !placed.contains(name))
        .collect();

    let on_cycle: Vec<String> = definition
        .phases
        .iter()
        .map(|p| &p.name)
        .filter(|name| remaining.contains(name) && reaches_itself(name, &remaining, downstream))
        .map(|name| name.to_string())
        .collect();

    Err(WorkflowError::CycleDetected(on_cycle))
}

fn reaches_itself(
    start: &PhaseName,
    within: &HashSet<&PhaseName>,
    downstream: &HashMap<PhaseName, BTreeSet<PhaseName>>,
) -> bool {
    let mut seen: HashSet<&PhaseName> = HashSet::new();
    let mut stack: Vec<&PhaseName> = vec![start];
    while let Some(current) = stack.pop() {
        for next in downstream.get(current).into_iter().flatten() {
            if next == start {
                return true;
            }
            if within.contains(next) && seen.insert(next) {
                stack.push(next);
            }
        }
    }
    false
}

// ============================================================================
// Run state
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl NodeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeState::Completed | NodeState::Failed | NodeState::Skipped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Pending => "pending",
            NodeState::Running => "running",
            NodeState::Completed => "completed",
            NodeState::Failed => "failed",
            NodeState::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "phase", rename_all = "snake_case")]
pub enum SkipReason {
    /// An upstream phase failed.
    DependencyFailed(PhaseName),
    /// The abort policy stopped the run after a failure elsewhere.
    RunAborted,
    /// The run was cancelled before the node started.
    Cancelled,
}

#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
pub enum NodeError {
    #[error("Phase request rejected by validation: {}", format_field_errors(.errors))]
    Rejected { errors: Vec<FieldError> },

    #[error("Phase request was not delivered to agent '{0}'")]
    NotDelivered(AgentId),

    #[error("Agent handler faulted: {0}")]
    HandlerFault(String),

    #[error("Agent declined the phase")]
    Declined,

    #[error("Phase timed out after {0:?}")]
    Timeout(Duration),

    #[error("Consensus not reached ({approvals}/{threshold} approvals)")]
    ConsensusNotReached { approvals: usize, threshold: usize },

    /// The run was cancelled after this node started. Nodes only move to
    /// `Skipped` from `Pending`, so an interrupted node ends `Failed` with this
    /// error, while nodes that never started are skipped with
    /// [`SkipReason::Cancelled`].
    #[error("Phase was cancelled while running")]
    Cancelled,

    #[error("Context slice could not be delivered: {0}")]
    ContextNotDelivered(String),

    #[error("Phase task ended unexpectedly: {0}")]
    Lost(String),
}

fn format_field_errors(errors: &[FieldError]) -> String {
    errors.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

/// Per-node bookkeeping kept by a [`DagRun`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub state: NodeState,
    pub agent: AgentId,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub output: Option<Value>,
    pub error: Option<NodeError>,
    pub skip_reason: Option<SkipReason>,
    pub consensus: Option<ConsensusResult>,
}

impl NodeRecord {
    fn pending(agent: AgentId) -> Self {
        Self {
            state: NodeState::Pending,
            agent,
            started_at: None,
            finished_at: None,
            output: None,
            error: None,
            skip_reason: None,
            consensus: None,
        }
    }

    pub fn duration(&self) -> Option<Duration> {
        let started = self.started_at?;
        let finished = self.finished_at?;
        (finished - started).to_std().ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Running,
    Completed,
    Failed,
    PartiallyFailed,
    Cancelled,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunState::Running => "running",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
            RunState::PartiallyFailed => "partially_failed",
            RunState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Mutable state of one workflow execution.
#[derive(Debug, Clone)]
pub struct DagRun {
    run_id: RunId,
    nodes: HashMap<PhaseName, NodeRecord>,
    order: Vec<PhaseName>,
    state: RunState,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl DagRun {
    pub fn new(run_id: RunId, dag: &Dag) -> Self {
        let nodes = dag
            .definition
            .phases
            .iter()
            .map(|p| (p.name.clone(), NodeRecord::pending(p.agent.clone())))
            .collect();
        Self {
            run_id,
            nodes,
            order: dag.order.clone(),
            state: RunState::Running,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn node(&self, name: &str) -> Option<&NodeRecord> {
        self.nodes.get(name)
    }

    pub fn node_state(&self, name: &str) -> Option<NodeState> {
        self.nodes.get(name).map(|n| n.state)
    }

    pub fn count(&self, state: NodeState) -> usize {
        self.nodes.values().filter(|n| n.state == state).count()
    }

    pub fn is_settled(&self) -> bool {
        self.nodes.values().all(|n| n.state.is_terminal())
    }

    /// Pending nodes whose dependencies all completed, in topological order.
    pub fn eligible(&self, dag: &Dag) -> Vec<PhaseName> {
        self.order
            .iter()
            .filter(|name| self.node_state(name.as_str()) == Some(NodeState::Pending))
            .filter(|name| {
                dag.dependencies_of(name.as_str())
                    .all(|dep| self.node_state(dep.as_str()) == Some(NodeState::Completed))
            })
            .cloned()
            .collect()
    }

    /// Outputs of the completed direct dependencies of `name`.
    pub fn upstream_outputs(&self, dag: &Dag, name: &str) -> serde_json::Map<String, Value> {
        dag.dependencies_of(name)
            .filter_map(|dep| {
                let record = self.nodes.get(dep.as_str())?;
                Some((dep.to_string(), record.output.clone().unwrap_or(Value::Null)))
            })
            .collect()
    }

    /// `Pending → Running`; every dependency must already be `Completed`.
    pub fn start_node(&mut self, dag: &Dag, name: &str) -> Result<(), WorkflowError> {
        let blocked = dag
            .dependencies_of(name)
            .any(|dep| self.node_state(dep.as_str()) != Some(NodeState::Completed));
        let record = self.record_mut(name)?;
        if record.state != NodeState::Pending || blocked {
            return Err(WorkflowError::IllegalTransition {
                node: name.to_string(),
                from: record.state,
                to: NodeState::Running,
            });
        }
        record.state = NodeState::Running;
        record.started_at = Some(Utc::now());
        Ok(())
    }

    pub fn complete_node(
        &mut self,
        name: &str,
        output: Value,
        consensus: Option<ConsensusResult>,
    ) -> Result<(), WorkflowError> {
        let record = self.finish(name, NodeState::Completed)?;
        record.output = Some(output);
        record.consensus = consensus;
        Ok(())
    }

    pub fn fail_node(
        &mut self,
        name: &str,
        error: NodeError,
        consensus: Option<ConsensusResult>,
    ) -> Result<(), WorkflowError> {
        let record = self.finish(name, NodeState::Failed)?;
        record.error = Some(error);
        record.consensus = consensus;
        Ok(())
    }

    /// `Pending → Skipped`.
    pub fn skip_node(&mut self, name: &str, reason: SkipReason) -> Result<(), WorkflowError> {
        let record = self.record_mut(name)?;
        if record.state != NodeState::Pending {
            return Err(WorkflowError::IllegalTransition {
                node: name.to_string(),
                from: record.state,
                to: NodeState::Skipped,
            });
        }
        record.state = NodeState::Skipped;
        record.skip_reason = Some(reason);
        record.finished_at = Some(Utc::now());
        Ok(())
    }

    /// Pending nodes in topological order.
    pub fn pending(&self) -> Vec<PhaseName> {
        self.order
            .iter()
            .filter(|name| self.node_state(name.as_str()) == Some(NodeState::Pending))
            .cloned()
            .collect()
    }

    /// Settle the aggregate state once every node is terminal.
    pub fn finalize(&mut self, policy: FailurePolicy, cancelled: bool) -> RunState {
        let failed = self.count(NodeState::Failed);
        let completed = self.count(NodeState::Completed);

        self.state = if cancelled {
            RunState::Cancelled
        } else if completed == self.nodes.len() {
            RunState::Completed
        } else if failed == 0 {
            // Only reachable when nodes were skipped without a failure.
            RunState::Cancelled
        } else {
            match policy {
                FailurePolicy::AbortDependents => RunState::Failed,
                FailurePolicy::ContinueIndependent if completed > 0 => RunState::PartiallyFailed,
                FailurePolicy::ContinueIndependent => RunState::Failed,
            }
        };
        self.finished_at = Some(Utc::now());
        self.state
    }

    pub fn report(&self, workflow: &str) -> RunReport {
        RunReport {
            run_id: self.run_id,
            workflow: workflow.to_string(),
            state: self.state,
            started_at: self.started_at,
            finished_at: self.finished_at,
            nodes: self
                .order
                .iter()
                .filter_map(|name| Some((name.to_string(), self.nodes.get(name.as_str())?.clone())))
                .collect(),
        }
    }

    fn record_mut(&mut self, name: &str) -> Result<&mut NodeRecord, WorkflowError> {
        self.nodes
            .get_mut(name)
            .ok_or_else(|| WorkflowError::UnknownPhase(name.to_string()))
    }

    fn finish(&mut self, name: &str, to: NodeState) -> Result<&mut NodeRecord, WorkflowError> {
        let record = self.record_mut(name)?;
        if record.state != NodeState::Running {
            return Err(WorkflowError::IllegalTransition {
                node: name.to_string(),
                from: record.state,
                to,
            });
        }
        record.state = to;
        record.finished_at = Some(Utc::now());
        Ok(record)
    }
}

/// Final summary of a run, keyed by phase name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub workflow: String,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub nodes: BTreeMap<String, NodeRecord>,
}

impl RunReport {
    pub fn node(&self, name: &str) -> Option<&NodeRecord> {
        self.nodes.get(name)
    }

    pub fn node_state(&self, name: &str) -> Option<NodeState> {
        self.nodes.get(name).map(|n| n.state)
    }

    pub fn output(&self, name: &str) -> Option<&Value> {
        self.nodes.get(name)?.output.as_ref()
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, Error, PartialEq)]
pub enum WorkflowError {
    #[error("Workflow must declare at least one phase")]
    NoPhases,

    #[error("Invalid phase name: '{0}'")]
    InvalidPhaseName(String),

    #[error("Duplicate phase name: '{0}'")]
    DuplicatePhase(String),

    #[error("Dependency '{from}' -> '{to}' references an undeclared phase")]
    UnknownDependency { from: String, to: String },

    #[error("Cycle detected between phases: {}", .0.join(", "))]
    CycleDetected(Vec<String>),

    #[error("Invalid consensus gate on phase '{phase}': {source}")]
    InvalidConsensus {
        phase: String,
        #[source]
        source: ConsensusError,
    },

    #[error("maxConcurrency must be at least 1")]
    InvalidConcurrency,

    #[error("Phase '{phase}' references unregistered agent '{agent}'")]
    UnknownAgent { phase: String, agent: AgentId },

    #[error("Phase '{0}' not found in workflow")]
    UnknownPhase(String),

    #[error("Illegal transition for phase '{node}': {from} -> {to}")]
    IllegalTransition {
        node: String,
        from: NodeState,
        to: NodeState,
    },

    #[error("Failed to parse workflow definition: {0}")]
    Parse(String),

    #[error("Workflow run aborted: {0}")]
    Aborted(String),
}
