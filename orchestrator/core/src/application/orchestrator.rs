// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! DAG Orchestrator
//!
//! Executes a validated [`Dag`]. A single coordinator task owns the
//! [`DagRun`]; node executions run as tokio tasks bounded by the effective
//! `max_concurrency`. For every node the coordinator:
//!
//! 1. hands the phase's agent a context slice (input plus upstream outputs),
//! 2. dispatches one targeted `workflow.phase.execute` event,
//! 3. runs the phase's consensus gate on the result, when it declares one.
//!
//! Steps 1 and 2 share the node timeout and end early on cancellation; the
//! consensus gate runs under its own timeout.
//!
//! After a failure the [`FailurePolicy`] decides what still runs.

use chrono::Utc;
use futures::FutureExt;
use serde_json::{json, Value};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::agent_registry::AgentRegistry;
use crate::application::consensus::{Ballot, ConsensusGate};
use crate::application::context_propagator::ContextPropagator;
use crate::domain::agent::{AgentId, Decision};
use crate::domain::consensus::ConsensusResult;
use crate::domain::context::{ContextSliceInput, PropagationMode};
use crate::domain::coordinator_config::OrchestratorConfig;
use crate::domain::events::event_types::PHASE_EXECUTE;
use crate::domain::events::{CoordinationNotice, CorrelationId, PhaseExecute, TraceId};
use crate::domain::workflow::{
    ConsensusSpec, Dag, DagRun, FailurePolicy, NodeError, NodeState, PhaseDefinition, PhaseName, RunId,
    RunReport, SkipReason, WorkflowDefinition, WorkflowError,
};
use crate::infrastructure::event_bus::{DeliveryResult, EventBus, OutboundEvent, PublishStatus};

/// Handle to a run started with [`DagOrchestrator::start`].
pub struct RunHandle {
    run_id: RunId,
    trace_id: TraceId,
    cancel: CancellationToken,
    task: JoinHandle<RunReport>,
}

impl RunHandle {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    /// Request cancellation: nothing new starts and running nodes are abandoned.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn wait(self) -> Result<RunReport, WorkflowError> {
        self.task
            .await
            .map_err(|e| WorkflowError::Aborted(e.to_string()))
    }
}

enum NodeOutcome {
    Completed {
        output: Value,
        consensus: Option<ConsensusResult>,
    },
    Failed {
        error: NodeError,
        consensus: Option<ConsensusResult>,
    },
}

/// Everything one node task needs, detached from the coordinator.
#[derive(Clone)]
struct NodeContext {
    bus: Arc<EventBus>,
    propagator: Arc<ContextPropagator>,
    gate: Arc<ConsensusGate>,
    run_id: RunId,
    trace_id: TraceId,
    node_timeout: Duration,
    consensus_timeout: Duration,
    cancel: CancellationToken,
}

#[derive(Clone)]
pub struct DagOrchestrator {
    bus: Arc<EventBus>,
    registry: Arc<AgentRegistry>,
    propagator: Arc<ContextPropagator>,
    gate: Arc<ConsensusGate>,
    config: OrchestratorConfig,
}

impl DagOrchestrator {
    pub fn new(
        bus: Arc<EventBus>,
        registry: Arc<AgentRegistry>,
        propagator: Arc<ContextPropagator>,
        config: OrchestratorConfig,
    ) -> Self {
        let gate = Arc::new(ConsensusGate::new(Arc::clone(&bus)));
        Self {
            bus,
            registry,
            propagator,
            gate,
            config,
        }
    }

    pub fn gate(&self) -> &Arc<ConsensusGate> {
        &self.gate
    }

    /// Build the graph and check that every agent it names is registered.
    pub fn prepare(&self, definition: WorkflowDefinition) -> Result<Dag, WorkflowError> {
        let dag = Dag::build(definition)?;
        for phase in &dag.definition().phases {
            let voters = phase
                .consensus
                .iter()
                .flat_map(|c| c.required_agents.iter());
            for agent in std::iter::once(&phase.agent).chain(voters) {
                if !self.registry.contains(agent) {
                    return Err(WorkflowError::UnknownAgent {
                        phase: phase.name.to_string(),
                        agent: agent.clone(),
                    });
                }
            }
        }
        Ok(dag)
    }

    /// Validate `definition` and start executing it in the background.
    pub fn start(&self, definition: WorkflowDefinition, input: Value) -> Result<RunHandle, WorkflowError> {
        let dag = Arc::new(self.prepare(definition)?);
        let run_id = RunId::new();
        let trace_id = TraceId::new();
        let cancel = CancellationToken::new();

        let orchestrator = self.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            orchestrator.execute(dag, run_id, trace_id, input, token).await
        });

        Ok(RunHandle {
            run_id,
            trace_id,
            cancel,
            task,
        })
    }

    /// Start a run and wait for its report.
    pub async fn run(&self, definition: WorkflowDefinition, input: Value) -> Result<RunReport, WorkflowError> {
        self.start(definition, input)?.wait().await
    }

    /// Coordinator loop. Owns the run state; node tasks only report outcomes.
    pub async fn execute(
        &self,
        dag: Arc<Dag>,
        run_id: RunId,
        trace_id: TraceId,
        input: Value,
        cancel: CancellationToken,
    ) -> RunReport {
        let definition = dag.definition();
        let policy = definition.policy.unwrap_or(self.config.failure_policy);
        let limit = definition
            .max_concurrency
            .map(|n| n.min(self.config.max_concurrency))
            .unwrap_or(self.config.max_concurrency)
            .max(1);

        info!(
            run_id = %run_id,
            trace_id = %trace_id,
            workflow = %dag.name(),
            phases = dag.len(),
            max_concurrency = limit,
            policy = ?policy,
            "Workflow run started"
        );

        let ctx = NodeContext {
            bus: Arc::clone(&self.bus),
            propagator: Arc::clone(&self.propagator),
            gate: Arc::clone(&self.gate),
            run_id,
            trace_id,
            node_timeout: self.config.node_timeout,
            consensus_timeout: self.config.consensus_timeout,
            cancel: cancel.child_token(),
        };

        let mut run = DagRun::new(run_id, &dag);
        let mut tasks: JoinSet<(PhaseName, NodeOutcome)> = JoinSet::new();
        let mut aborted = false;
        let mut cancelled = false;

        loop {
            if !aborted && !cancelled {
                for name in run.eligible(&dag) {
                    if tasks.len() >= limit {
                        break;
                    }
                    let Some(phase) = dag.phase(name.as_str()).cloned() else {
                        continue;
                    };
                    if let Err(e) = run.start_node(&dag, name.as_str()) {
                        warn!(run_id = %run_id, node = %name, error = %e, "Could not start node");
                        continue;
                    }
                    self.node_changed(run_id, &name, NodeState::Running);

                    let upstream = run.upstream_outputs(&dag, name.as_str());
                    let ctx = ctx.clone();
                    let input = input.clone();
                    tasks.spawn(async move {
                        let outcome = AssertUnwindSafe(run_node(&ctx, &phase, input, upstream))
                            .catch_unwind()
                            .await
                            .unwrap_or_else(|_| NodeOutcome::Failed {
                                error: NodeError::Lost("node task panicked".to_string()),
                                consensus: None,
                            });
                        (phase.name, outcome)
                    });
                }
            }

            if tasks.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled(), if !cancelled => {
                    info!(run_id = %run_id, "Workflow run cancellation requested");
                    cancelled = true;
                }
                joined = tasks.join_next() => match joined {
                    Some(Ok((name, outcome))) => {
                        let failed = self.record_outcome(&mut run, &name, outcome);
                        if failed && !cancelled {
                            self.skip_descendants(&mut run, &dag, &name);
                            if policy == FailurePolicy::AbortDependents {
                                aborted = true;
                            }
                        }
                    }
                    Some(Err(e)) => warn!(run_id = %run_id, error = %e, "Node task ended abnormally"),
                    None => {}
                },
            }
        }

        // Nodes whose task vanished without reporting.
        for name in dag.topological_order() {
            if run.node_state(name.as_str()) == Some(NodeState::Running) {
                match run.fail_node(name.as_str(), NodeError::Lost("no outcome reported".to_string()), None) {
                    Ok(()) => self.node_changed(run_id, name, NodeState::Failed),
                    Err(e) => warn!(run_id = %run_id, node = %name, error = %e, "Could not fail lost node"),
                }
            }
        }

        let reason = if cancelled {
            SkipReason::Cancelled
        } else {
            SkipReason::RunAborted
        };
        for name in run.pending() {
            if run.skip_node(name.as_str(), reason.clone()).is_ok() {
                self.node_changed(run_id, &name, NodeState::Skipped);
            }
        }

        let state = run.finalize(policy, cancelled);
        self.bus.notify(CoordinationNotice::RunFinished {
            run_id,
            state,
            finished_at: Utc::now(),
        });
        info!(
            run_id = %run_id,
            workflow = %dag.name(),
            state = %state,
            completed = run.count(NodeState::Completed),
            failed = run.count(NodeState::Failed),
            skipped = run.count(NodeState::Skipped),
            "Workflow run finished"
        );
        run.report(dag.name())
    }

    /// Apply a node outcome; returns true when the node failed.
    fn record_outcome(&self, run: &mut DagRun, name: &PhaseName, outcome: NodeOutcome) -> bool {
        let run_id = run.run_id();
        let (state, result) = match outcome {
            NodeOutcome::Completed { output, consensus } => (
                NodeState::Completed,
                run.complete_node(name.as_str(), output, consensus),
            ),
            NodeOutcome::Failed { error, consensus } => {
                warn!(run_id = %run_id, node = %name, error = %error, "Node failed");
                (
                    NodeState::Failed,
                    run.fail_node(name.as_str(), error, consensus),
                )
            }
        };

        if let Err(e) = result {
            warn!(run_id = %run_id, node = %name, error = %e, "Discarding node outcome");
            return false;
        }
        metrics::counter!("concord_nodes_finished_total", "state" => state.as_str()).increment(1);
        self.node_changed(run_id, name, state);
        state == NodeState::Failed
    }

    fn skip_descendants(&self, run: &mut DagRun, dag: &Dag, failed: &PhaseName) {
        for name in dag.descendants_of(failed.as_str()) {
            if run
                .skip_node(name.as_str(), SkipReason::DependencyFailed(failed.clone()))
                .is_ok()
            {
                self.node_changed(run.run_id(), &name, NodeState::Skipped);
            }
        }
    }

    fn node_changed(&self, run_id: RunId, name: &PhaseName, state: NodeState) {
        debug!(run_id = %run_id, node = %name, state = %state, "Node state changed");
        self.bus.notify(CoordinationNotice::NodeStateChanged {
            run_id,
            node: name.to_string(),
            state,
            changed_at: Utc::now(),
        });
    }
}

async fn run_node(
    ctx: &NodeContext,
    phase: &PhaseDefinition,
    input: Value,
    upstream: serde_json::Map<String, Value>,
) -> NodeOutcome {
    let node_timeout = phase.timeout.unwrap_or(ctx.node_timeout);
    let slice_id = format!("{}:{}", ctx.run_id, phase.name);

    // Context handover and phase dispatch share one deadline.
    let attempt = tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => Err(NodeError::Cancelled),
        finished = tokio::time::timeout(
            node_timeout,
            execute_phase(ctx, phase, &slice_id, input, upstream, node_timeout),
        ) => finished.unwrap_or(Err(NodeError::Timeout(node_timeout))),
    };

    // The slice only lives as long as the phase execution.
    if let Err(e) = ctx.propagator.remove_slice(&slice_id) {
        debug!(run_id = %ctx.run_id, node = %phase.name, error = %e, "Node context slice already gone");
    }

    let output = match attempt {
        Ok(output) => output,
        Err(error) => {
            return NodeOutcome::Failed {
                error,
                consensus: None,
            }
        }
    };
    match &phase.consensus {
        Some(spec) => gather_consensus(ctx, phase, spec, output).await,
        None => NodeOutcome::Completed {
            output,
            consensus: None,
        },
    }
}

/// Hand over the node's context, then dispatch the phase to its agent.
async fn execute_phase(
    ctx: &NodeContext,
    phase: &PhaseDefinition,
    slice_id: &str,
    input: Value,
    upstream: serde_json::Map<String, Value>,
    node_timeout: Duration,
) -> Result<Value, NodeError> {
    hand_over_context(ctx, phase, slice_id, &input, &upstream, node_timeout)
        .await
        .map_err(NodeError::ContextNotDelivered)?;

    let request = PhaseExecute {
        run_id: ctx.run_id.to_string(),
        phase: phase.name.to_string(),
        input,
        upstream,
    };
    let payload = serde_json::to_value(&request).map_err(|e| NodeError::Lost(e.to_string()))?;
    let outbound = OutboundEvent::new(PHASE_EXECUTE, payload, AgentId::runtime())
        .to_agent(phase.agent.clone())
        .with_trace(ctx.trace_id)
        .with_correlation(CorrelationId::from(ctx.trace_id));

    debug!(run_id = %ctx.run_id, node = %phase.name, agent_id = %phase.agent, "Dispatching phase");
    let receipt = ctx.bus.dispatch(outbound).await;

    match &receipt.status {
        PublishStatus::Rejected { errors } => Err(NodeError::Rejected {
            errors: errors.clone(),
        }),
        PublishStatus::Delivered { .. } => match receipt.delivery_to(&phase.agent) {
            None => Err(NodeError::NotDelivered(phase.agent.clone())),
            Some(delivery) => match &delivery.result {
                DeliveryResult::Faulted { reason } => Err(NodeError::HandlerFault(reason.clone())),
                DeliveryResult::Handled(handled) if handled.decision == Some(Decision::Reject) => {
                    Err(NodeError::Declined)
                }
                DeliveryResult::Handled(handled) => Ok(handled.output.clone()),
            },
        },
    }
}

async fn gather_consensus(
    ctx: &NodeContext,
    phase: &PhaseDefinition,
    spec: &ConsensusSpec,
    output: Value,
) -> NodeOutcome {
    let request = match spec.to_request(ctx.consensus_timeout) {
        Ok(request) => request,
        Err(e) => {
            return NodeOutcome::Failed {
                error: NodeError::Lost(e.to_string()),
                consensus: None,
            }
        }
    };
    let ballot = Ballot {
        run_id: ctx.run_id.to_string(),
        phase: phase.name.to_string(),
        proposal: output.clone(),
        trace_id: Some(ctx.trace_id),
        correlation_id: Some(CorrelationId::from(ctx.trace_id)),
    };
    let result = ctx.gate.collect(&request, &ballot, &ctx.cancel).await;

    if result.abandoned {
        NodeOutcome::Failed {
            error: NodeError::Cancelled,
            consensus: Some(result),
        }
    } else if result.reached {
        NodeOutcome::Completed {
            output,
            consensus: Some(result),
        }
    } else {
        NodeOutcome::Failed {
            error: NodeError::ConsensusNotReached {
                approvals: result.approvals.len(),
                threshold: request.threshold,
            },
            consensus: Some(result),
        }
    }
}

/// Create the node's context slice and deliver it to the phase's agent.
async fn hand_over_context(
    ctx: &NodeContext,
    phase: &PhaseDefinition,
    slice_id: &str,
    input: &Value,
    upstream: &serde_json::Map<String, Value>,
    ttl: Duration,
) -> Result<(), String> {
    let slice = ctx
        .propagator
        .create_slice(
            ContextSliceInput::new(slice_id)
                .owner(AgentId::runtime())
                .domain(format!("run:{}:{}", ctx.run_id, phase.name))
                .state(json!({ "input": input, "upstream": upstream }))
                .priority(phase.priority)
                .ttl(ttl)
                .metadata("phase", json!(phase.name.as_str())),
        )
        .map_err(|e| e.to_string())?;

    let result = ctx
        .propagator
        .propagate_with_trace(
            &slice.id,
            PropagationMode::targeted([phase.agent.clone()]),
            Some(ctx.trace_id),
            Some(CorrelationId::from(ctx.trace_id)),
        )
        .await
        .map_err(|e| e.to_string())?;

    if let Some(failure) = result.failed.first() {
        return Err(failure.reason.clone());
    }
    if result.delivered.contains(&phase.agent) {
        Ok(())
    } else if result.superseded.contains(&phase.agent) {
        Err(format!("slice '{}' superseded for agent '{}'", slice.id, phase.agent))
    } else if result.expired.contains(&phase.agent) {
        Err(format!("slice '{}' expired before reaching '{}'", slice.id, phase.agent))
    } else {
        Err(format!("slice '{}' did not reach '{}'", slice.id, phase.agent))
    }
}
