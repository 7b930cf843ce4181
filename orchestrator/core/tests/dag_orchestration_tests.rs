// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

mod common;

use common::{ContextScript, MockAgent, PhaseScript, VoteScript};
use concord_core::domain::agent::AgentId;
use concord_core::domain::coordinator_config::CoordinatorConfig;
use concord_core::domain::events::CoordinationNotice;
use concord_core::domain::workflow::{
    FailurePolicy, NodeError, NodeState, PhaseName, RunState, SkipReason, WorkflowError,
};
use concord_core::infrastructure::event_bus::EventBusError;
use concord_core::infrastructure::workflow_parser::WorkflowParser;
use concord_core::CoordinationRuntime;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const STEP: Duration = Duration::from_millis(50);

fn runtime(agents: Vec<MockAgent>) -> (CoordinationRuntime, Vec<Arc<MockAgent>>) {
    let runtime = CoordinationRuntime::new(CoordinatorConfig::default());
    let agents = agents
        .into_iter()
        .map(|agent| {
            let agent = agent.arc();
            runtime.register_agent(agent.clone()).unwrap();
            agent
        })
        .collect();
    (runtime, agents)
}

const DIAMOND: &str = r#"
name: diamond
phases:
  - { name: a, agent: worker }
  - { name: b, agent: worker }
  - { name: c, agent: worker }
  - { name: d, agent: worker }
dependencies:
  - { from: a, to: b }
  - { from: a, to: c }
  - { from: b, to: d }
  - { from: c, to: d }
"#;

#[tokio::test]
async fn test_cycle_is_rejected_before_any_node_runs() {
    let (runtime, agents) = runtime(vec![MockAgent::new("worker")]);
    let mut notices = runtime.bus().watch();
    let definition = WorkflowParser::parse_yaml(
        r#"
name: loop
phases:
  - { name: a, agent: worker }
  - { name: b, agent: worker }
dependencies:
  - { from: a, to: b }
  - { from: b, to: a }
"#,
    )
    .unwrap();

    let result = runtime.start_workflow(definition, json!({}));

    match result {
        Err(WorkflowError::CycleDetected(nodes)) => assert_eq!(nodes, vec!["a", "b"]),
        Err(other) => panic!("unexpected error {other}"),
        Ok(_) => panic!("cyclic workflow was accepted"),
    }
    assert!(matches!(notices.try_recv(), Err(EventBusError::Empty)));
    assert!(agents[0].phase_calls.lock().is_empty());
}

#[tokio::test]
async fn test_diamond_runs_in_dependency_order_with_parallel_middle() {
    let (runtime, agents) = runtime(vec![MockAgent::new("worker").phase_delay(STEP)]);
    let worker = &agents[0];

    let report = runtime
        .run_workflow(WorkflowParser::parse_yaml(DIAMOND).unwrap(), json!({ "ticket": 7 }))
        .await
        .unwrap();

    assert_eq!(report.state, RunState::Completed);
    let a = worker.phase_call("a").unwrap();
    let b = worker.phase_call("b").unwrap();
    let c = worker.phase_call("c").unwrap();
    let d = worker.phase_call("d").unwrap();

    assert!(a.finished <= b.started && a.finished <= c.started);
    assert!(b.started < c.finished && c.started < b.finished, "b and c did not overlap");
    assert!(d.started >= b.finished && d.started >= c.finished);

    let mut upstream: Vec<&String> = d.upstream.keys().collect();
    upstream.sort();
    assert_eq!(upstream, vec!["b", "c"]);
    assert_eq!(report.output("d"), Some(&json!({ "by": "worker" })));
}

#[tokio::test]
async fn test_max_concurrency_one_serializes_independent_phases() {
    let (runtime, agents) = runtime(vec![MockAgent::new("worker").phase_delay(STEP)]);
    let definition = WorkflowParser::parse_yaml(
        r#"
name: flat
maxConcurrency: 1
phases:
  - { name: x, agent: worker }
  - { name: y, agent: worker }
  - { name: z, agent: worker }
"#,
    )
    .unwrap();

    let report = runtime.run_workflow(definition, json!(null)).await.unwrap();
    assert_eq!(report.state, RunState::Completed);

    let mut calls = agents[0].phase_calls.lock().clone();
    calls.sort_by_key(|c| c.started);
    for pair in calls.windows(2) {
        assert!(pair[0].finished <= pair[1].started, "{} overlapped {}", pair[0].phase, pair[1].phase);
    }
}

#[tokio::test]
async fn test_node_state_notices_follow_the_state_machine() {
    let (runtime, _) = runtime(vec![MockAgent::new("worker")]);
    let mut notices = runtime.bus().watch();

    let report = runtime
        .run_workflow(WorkflowParser::parse_yaml(DIAMOND).unwrap(), json!({}))
        .await
        .unwrap();

    let mut transitions = Vec::new();
    let mut finished = None;
    loop {
        match notices.try_recv() {
            Ok(CoordinationNotice::NodeStateChanged { node, state, .. }) => transitions.push((node, state)),
            Ok(CoordinationNotice::RunFinished { run_id, state, .. }) => finished = Some((run_id, state)),
            Ok(_) => {}
            Err(_) => break,
        }
    }

    assert_eq!(finished, Some((report.run_id, RunState::Completed)));
    for node in ["a", "b", "c", "d"] {
        let states: Vec<NodeState> = transitions
            .iter()
            .filter(|(n, _)| n == node)
            .map(|(_, s)| *s)
            .collect();
        assert_eq!(states, vec![NodeState::Running, NodeState::Completed], "node {}", node);
    }
    assert_eq!(transitions.first().map(|(n, _)| n.as_str()), Some("a"));
}

const BRANCHES: &str = r#"
name: branches
phases:
  - { name: broken, agent: flaky }
  - { name: after-broken, agent: worker }
  - { name: slow, agent: worker }
  - { name: after-slow, agent: worker }
dependencies:
  - { from: broken, to: after-broken }
  - { from: slow, to: after-slow }
"#;

fn branch_agents() -> Vec<MockAgent> {
    vec![
        MockAgent::new("flaky").on_phase("broken", PhaseScript::Fail("disk full".to_string())),
        MockAgent::new("worker").phase_delay(STEP),
    ]
}

#[tokio::test]
async fn test_abort_dependents_stops_new_work_after_failure() {
    let (runtime, _) = runtime(branch_agents());

    let report = runtime
        .run_workflow(WorkflowParser::parse_yaml(BRANCHES).unwrap(), json!({}))
        .await
        .unwrap();

    assert_eq!(report.state, RunState::Failed);
    let broken = report.node("broken").unwrap();
    assert_eq!(broken.state, NodeState::Failed);
    assert!(matches!(&broken.error, Some(NodeError::HandlerFault(reason)) if reason.contains("disk full")));

    let after_broken = report.node("after-broken").unwrap();
    assert_eq!(after_broken.state, NodeState::Skipped);
    assert_eq!(
        after_broken.skip_reason,
        Some(SkipReason::DependencyFailed(PhaseName::new("broken").unwrap()))
    );

    // Already running when the failure landed, so it finishes.
    assert_eq!(report.node_state("slow"), Some(NodeState::Completed));
    let after_slow = report.node("after-slow").unwrap();
    assert_eq!(after_slow.state, NodeState::Skipped);
    assert_eq!(after_slow.skip_reason, Some(SkipReason::RunAborted));
}

#[tokio::test]
async fn test_continue_independent_finishes_unrelated_branches() {
    let (runtime, _) = runtime(branch_agents());
    let mut definition = WorkflowParser::parse_yaml(BRANCHES).unwrap();
    definition.policy = Some(FailurePolicy::ContinueIndependent);

    let report = runtime.run_workflow(definition, json!({})).await.unwrap();

    assert_eq!(report.state, RunState::PartiallyFailed);
    assert_eq!(report.node_state("after-broken"), Some(NodeState::Skipped));
    assert_eq!(report.node_state("slow"), Some(NodeState::Completed));
    assert_eq!(report.node_state("after-slow"), Some(NodeState::Completed));
}

#[tokio::test]
async fn test_phase_timeout_and_decline_fail_the_node() {
    let (runtime, _) = runtime(vec![
        MockAgent::new("sleeper").on_phase("wait", PhaseScript::Hang),
        MockAgent::new("critic").on_phase("judge", PhaseScript::Decline),
    ]);
    let definition = WorkflowParser::parse_yaml(
        r#"
name: failures
policy: continue_independent
phases:
  - { name: wait, agent: sleeper, timeoutMs: 50 }
  - { name: judge, agent: critic }
"#,
    )
    .unwrap();

    let report = runtime.run_workflow(definition, json!({})).await.unwrap();

    assert_eq!(report.state, RunState::Failed);
    assert_eq!(
        report.node("wait").unwrap().error,
        Some(NodeError::Timeout(Duration::from_millis(50)))
    );
    assert_eq!(report.node("judge").unwrap().error, Some(NodeError::Declined));
}

#[tokio::test]
async fn test_consensus_gate_decides_phase_outcome() {
    let (runtime, _) = runtime(vec![
        MockAgent::new("author"),
        MockAgent::new("x").voting(VoteScript::Approve(Duration::from_millis(10))),
        MockAgent::new("y").voting(VoteScript::Approve(Duration::from_millis(20))),
        MockAgent::new("z").voting(VoteScript::Silent),
    ]);

    let quorum = WorkflowParser::parse_yaml(
        r#"
name: quorum
phases:
  - name: review
    agent: author
    consensus: { requiredAgents: [x, y, z], threshold: 2, timeoutMs: 300 }
"#,
    )
    .unwrap();
    let report = runtime.run_workflow(quorum, json!({})).await.unwrap();
    assert_eq!(report.state, RunState::Completed);
    let consensus = report.node("review").unwrap().consensus.clone().unwrap();
    assert!(consensus.reached);
    assert_eq!(consensus.approvals, vec![AgentId::new("x"), AgentId::new("y")]);

    let unanimous = WorkflowParser::parse_yaml(
        r#"
name: unanimous
phases:
  - name: review
    agent: author
    consensus: { requiredAgents: [x, y, z], threshold: 3, timeoutMs: 200 }
"#,
    )
    .unwrap();
    let report = runtime.run_workflow(unanimous, json!({})).await.unwrap();
    assert_eq!(report.state, RunState::Failed);
    let review = report.node("review").unwrap();
    assert_eq!(
        review.error,
        Some(NodeError::ConsensusNotReached { approvals: 2, threshold: 3 })
    );
    let consensus = review.consensus.as_ref().unwrap();
    assert!(!consensus.reached);
    assert!(consensus.timed_out);
}

#[tokio::test]
async fn test_cancel_abandons_running_nodes_and_skips_the_rest() {
    let (runtime, _) = runtime(vec![MockAgent::new("sleeper").on_phase("first", PhaseScript::Hang)]);
    let definition = WorkflowParser::parse_yaml(
        r#"
name: cancellable
phases:
  - { name: first, agent: sleeper }
  - { name: second, agent: sleeper }
dependencies:
  - { from: first, to: second }
"#,
    )
    .unwrap();

    let handle = runtime.start_workflow(definition, json!({})).unwrap();
    tokio::time::sleep(STEP).await;
    handle.cancel();
    let report = tokio::time::timeout(Duration::from_secs(2), handle.wait())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(report.state, RunState::Cancelled);
    let first = report.node("first").unwrap();
    assert_eq!(first.state, NodeState::Failed);
    assert_eq!(first.error, Some(NodeError::Cancelled));
    assert_eq!(first.skip_reason, None);
    let second = report.node("second").unwrap();
    assert_eq!(second.state, NodeState::Skipped);
    assert_eq!(second.skip_reason, Some(SkipReason::Cancelled));
}

#[tokio::test]
async fn test_unregistered_agent_is_rejected_up_front() {
    let (runtime, _) = runtime(vec![MockAgent::new("worker")]);
    let definition = WorkflowParser::parse_yaml(
        r#"
name: missing
phases:
  - name: review
    agent: worker
    consensus: { requiredAgents: [worker, nobody], threshold: 1 }
"#,
    )
    .unwrap();

    match runtime.start_workflow(definition, json!({})) {
        Err(WorkflowError::UnknownAgent { phase, agent }) => {
            assert_eq!(phase, "review");
            assert_eq!(agent, AgentId::new("nobody"));
        }
        Err(other) => panic!("unexpected error {other}"),
        Ok(_) => panic!("workflow with unknown agent was accepted"),
    }
}

#[tokio::test]
async fn test_phase_agent_receives_context_before_execution() {
    let (runtime, agents) = runtime(vec![MockAgent::new("worker")]);
    let definition = WorkflowParser::parse_yaml("name: one\nphases:\n  - { name: only, agent: worker }\n").unwrap();

    let report = runtime.run_workflow(definition, json!({ "goal": "ship" })).await.unwrap();

    assert_eq!(report.state, RunState::Completed);
    assert_eq!(
        agents[0].received_types(),
        vec!["context.update".to_string(), "workflow.phase.execute".to_string()]
    );
    assert!(runtime.propagator().is_empty());
}

#[tokio::test]
async fn test_hanging_context_handover_counts_against_node_timeout() {
    let (runtime, agents) = runtime(vec![MockAgent::new("worker").on_context(ContextScript::Hang)]);
    let definition = WorkflowParser::parse_yaml(
        "name: stuck\nphases:\n  - { name: only, agent: worker, timeoutMs: 100 }\n",
    )
    .unwrap();

    let report = tokio::time::timeout(Duration::from_secs(2), runtime.run_workflow(definition, json!({})))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(report.state, RunState::Failed);
    assert_eq!(
        report.node("only").unwrap().error,
        Some(NodeError::Timeout(Duration::from_millis(100)))
    );
    assert!(agents[0].phase_calls.lock().is_empty());
    assert!(runtime.propagator().is_empty());
}

#[tokio::test]
async fn test_cancel_interrupts_hanging_context_handover() {
    let (runtime, agents) = runtime(vec![MockAgent::new("worker").on_context(ContextScript::Hang)]);
    let definition = WorkflowParser::parse_yaml(
        r#"
name: stuck
phases:
  - { name: first, agent: worker }
  - { name: second, agent: worker }
dependencies:
  - { from: first, to: second }
"#,
    )
    .unwrap();

    let handle = runtime.start_workflow(definition, json!({})).unwrap();
    tokio::time::sleep(STEP).await;
    handle.cancel();
    let report = tokio::time::timeout(Duration::from_secs(2), handle.wait())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(report.state, RunState::Cancelled);
    assert_eq!(report.node("first").unwrap().error, Some(NodeError::Cancelled));
    assert_eq!(report.node("second").unwrap().skip_reason, Some(SkipReason::Cancelled));
    assert!(agents[0].phase_calls.lock().is_empty());
}

#[tokio::test]
async fn test_concurrent_phases_on_one_agent_each_receive_their_context() {
    let (runtime, agents) = runtime(vec![MockAgent::new("worker").phase_delay(Duration::from_millis(200))]);
    let definition = WorkflowParser::parse_yaml(
        r#"
name: shared-agent
phases:
  - { name: urgent, agent: worker, priority: high }
  - { name: routine, agent: worker, priority: low }
"#,
    )
    .unwrap();

    let report = runtime.run_workflow(definition, json!({})).await.unwrap();

    assert_eq!(report.state, RunState::Completed);
    let worker = &agents[0];
    let mut phases = worker.context_phases();
    phases.sort();
    assert_eq!(phases, vec!["routine".to_string(), "urgent".to_string()]);
    assert_eq!(worker.count_of("workflow.phase.execute"), 2);

    let urgent = worker.phase_call("urgent").unwrap();
    let routine = worker.phase_call("routine").unwrap();
    assert!(urgent.started < routine.finished && routine.started < urgent.finished);
}
