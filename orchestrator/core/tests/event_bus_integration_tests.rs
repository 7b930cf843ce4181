// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

mod common;

use common::MockAgent;
use concord_core::domain::agent::AgentId;
use concord_core::domain::coordinator_config::CoordinatorConfig;
use concord_core::domain::events::event_types::{
    COMPLIANCE_CHECK, KNOWLEDGE_QUERY, SPECIFICATION_VALIDATE, VALIDATION_FAILED,
};
use concord_core::domain::events::{CanonicalEvent, CoordinationNotice};
use concord_core::domain::schema::{FieldError, FieldType, SchemaDescriptor};
use concord_core::infrastructure::event_bus::{HistoryOutcome, PublishStatus};
use concord_core::infrastructure::schema_registry::SchemaRegistry;
use concord_core::CoordinationRuntime;
use serde_json::json;

fn specification(id: &str) -> serde_json::Value {
    json!({ "specification": { "id": id, "capabilities": ["lint", "test"] } })
}

#[tokio::test]
async fn test_aliased_type_is_validated_and_delivered_once() {
    let runtime = CoordinationRuntime::new(CoordinatorConfig::default());
    let validator = MockAgent::new("semantic-validator")
        .subscribed_to(SPECIFICATION_VALIDATE)
        .arc();
    runtime.register_agent(validator.clone()).unwrap();
    runtime.start().await;

    let receipt = runtime
        .publish(
            "semantic.validation.request",
            specification("spec-42"),
            AgentId::new("producer"),
        )
        .await;

    assert!(receipt.is_delivered());
    assert_eq!(receipt.event_type, SPECIFICATION_VALIDATE);
    assert_eq!(validator.count_of(SPECIFICATION_VALIDATE), 1);

    let received = validator.received.lock();
    match &received[0].body {
        CanonicalEvent::SpecificationValidate(body) => assert_eq!(body.specification.id, "spec-42"),
        other => panic!("unexpected body {:?}", other),
    }
    assert_eq!(received[0].trace_id(), receipt.trace_id);
}

#[tokio::test]
async fn test_missing_required_field_publishes_error_event_instead() {
    let runtime = CoordinationRuntime::new(CoordinatorConfig::default());
    let validator = MockAgent::new("semantic-validator")
        .subscribed_to(SPECIFICATION_VALIDATE)
        .arc();
    let monitor = MockAgent::new("monitor").subscribed_to(VALIDATION_FAILED).arc();
    runtime.register_agent(validator.clone()).unwrap();
    runtime.register_agent(monitor.clone()).unwrap();

    let receipt = runtime
        .publish(
            "semantic.validation.request",
            json!({ "specification": { "capabilities": [] } }),
            AgentId::new("producer"),
        )
        .await;

    assert!(!receipt.is_delivered());
    assert_eq!(
        receipt.errors(),
        &[FieldError::new("specification.id", "required field missing")]
    );
    assert_eq!(validator.count_of(SPECIFICATION_VALIDATE), 0);

    let errors = monitor.received.lock();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].trace_id(), receipt.trace_id);
    match &errors[0].body {
        CanonicalEvent::ValidationFailed(failure) => {
            assert_eq!(failure.original_type, SPECIFICATION_VALIDATE);
            assert_eq!(failure.errors[0].field, "specification.id");
        }
        other => panic!("unexpected body {:?}", other),
    }
}

#[tokio::test]
async fn test_every_subscriber_sees_every_event_in_publish_order() {
    const PRODUCED: usize = 20;

    let runtime = CoordinationRuntime::new(CoordinatorConfig::default());
    let subscribers: Vec<_> = (0..3)
        .map(|i| {
            let agent = MockAgent::new(&format!("reader-{}", i))
                .subscribed_to(KNOWLEDGE_QUERY)
                .arc();
            runtime.register_agent(agent.clone()).unwrap();
            agent
        })
        .collect();

    for n in 0..PRODUCED {
        let receipt = runtime
            .publish(
                "knowledge.search",
                json!({ "query": format!("q{}", n) }),
                AgentId::new("producer"),
            )
            .await;
        assert_eq!(receipt.deliveries().len(), subscribers.len());
    }

    let total: usize = subscribers.iter().map(|s| s.count_of(KNOWLEDGE_QUERY)).sum();
    assert_eq!(total, PRODUCED * subscribers.len());

    for subscriber in &subscribers {
        let queries: Vec<String> = subscriber
            .received
            .lock()
            .iter()
            .map(|e| match &e.body {
                CanonicalEvent::KnowledgeQuery(q) => q.query.clone(),
                other => panic!("unexpected body {:?}", other),
            })
            .collect();
        let expected: Vec<String> = (0..PRODUCED).map(|n| format!("q{}", n)).collect();
        assert_eq!(queries, expected);
    }
}

#[tokio::test]
async fn test_concurrent_producers_deliver_every_event() {
    let runtime = std::sync::Arc::new(CoordinationRuntime::new(CoordinatorConfig::default()));
    let reader = MockAgent::new("reader").subscribed_to(COMPLIANCE_CHECK).arc();
    runtime.register_agent(reader.clone()).unwrap();

    let mut producers = Vec::new();
    for p in 0..4 {
        let runtime = runtime.clone();
        producers.push(tokio::spawn(async move {
            for n in 0..10 {
                runtime
                    .publish(
                        "compliance.rules.evaluate",
                        json!({ "subject": format!("p{}-{}", p, n), "rules": ["gdpr"] }),
                        AgentId::new(format!("producer-{}", p)),
                    )
                    .await;
            }
        }));
    }
    for producer in producers {
        producer.await.unwrap();
    }

    assert_eq!(reader.count_of(COMPLIANCE_CHECK), 40);
}

#[tokio::test]
async fn test_unknown_type_passes_through_flagged() {
    let runtime = CoordinationRuntime::new(CoordinatorConfig::default());
    let sink = MockAgent::new("sink").subscribed_to("telemetry.ping").arc();
    runtime.register_agent(sink.clone()).unwrap();

    let receipt = runtime
        .publish("telemetry.ping", json!({ "anything": [1, 2, 3] }), AgentId::new("p"))
        .await;

    assert!(receipt.unknown);
    assert_eq!(receipt.event_type, "unknown.telemetry.ping");
    assert_eq!(receipt.deliveries().len(), 1);
    let received = sink.received.lock();
    assert!(received[0].is_unknown());
    assert_eq!(received[0].payload(), &json!({ "anything": [1, 2, 3] }));
}

#[tokio::test]
async fn test_runtime_registered_schema_is_enforced() {
    let mut schemas = SchemaRegistry::with_builtin_schemas();
    schemas
        .register_schema(
            "deployment.approve",
            SchemaDescriptor::new()
                .required("release", FieldType::String)
                .optional_with_default("canary", FieldType::Boolean, json!(true)),
        )
        .unwrap();
    let runtime = CoordinationRuntime::with_schemas(CoordinatorConfig::default(), schemas);
    let approver = MockAgent::new("approver").subscribed_to("deployment.approve").arc();
    runtime.register_agent(approver.clone()).unwrap();

    let ok = runtime
        .publish("deployment.approve", json!({ "release": "1.2.0" }), AgentId::new("p"))
        .await;
    assert!(ok.is_delivered());
    assert!(!ok.unknown);
    match &approver.received.lock()[0].body {
        CanonicalEvent::Custom { event_type, payload } => {
            assert_eq!(event_type, "deployment.approve");
            assert_eq!(payload["canary"], json!(true));
        }
        other => panic!("unexpected body {:?}", other),
    }

    let bad = runtime
        .publish("deployment.approve", json!({ "release": 12 }), AgentId::new("p"))
        .await;
    assert!(matches!(bad.status, PublishStatus::Rejected { .. }));
    assert_eq!(approver.count_of("deployment.approve"), 1);
}

#[tokio::test]
async fn test_legacy_envelope_is_unwrapped_at_ingress() {
    let runtime = CoordinationRuntime::new(CoordinatorConfig::default());
    let validator = MockAgent::new("semantic-validator")
        .subscribed_to(SPECIFICATION_VALIDATE)
        .arc();
    runtime.register_agent(validator.clone()).unwrap();

    let receipt = runtime
        .publish(
            "unknown.event.received",
            json!({ "eventType": "spec.validate", "payload": specification("wrapped") }),
            AgentId::new("legacy"),
        )
        .await;

    assert!(receipt.is_delivered());
    assert_eq!(receipt.event_type, SPECIFICATION_VALIDATE);
    assert_eq!(validator.count_of(SPECIFICATION_VALIDATE), 1);
}

#[tokio::test]
async fn test_history_and_notices_share_the_trace() {
    let runtime = CoordinationRuntime::new(CoordinatorConfig::default());
    let mut notices = runtime.bus().watch();

    let receipt = runtime
        .publish(KNOWLEDGE_QUERY, json!({ "limit": 3 }), AgentId::new("p"))
        .await;

    let history = runtime.bus().history_for(receipt.trace_id);
    assert_eq!(history.len(), 2);
    assert!(matches!(history[0].outcome, HistoryOutcome::Rejected { .. }));
    assert_eq!(history[1].event.event_type, VALIDATION_FAILED);

    match notices.recv().await.unwrap() {
        CoordinationNotice::EventRejected { trace_id, errors, .. } => {
            assert_eq!(trace_id, receipt.trace_id);
            assert_eq!(errors[0].field, "query");
        }
        other => panic!("unexpected notice {:?}", other),
    }
}
