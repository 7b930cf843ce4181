// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Coordination Runtime
//!
//! Composition root. Builds every component from a [`CoordinatorConfig`] and
//! wires them together explicitly:
//!
//! ```text
//! SchemaRegistry → EventValidationEngine → EventBus → AgentRegistry
//!                                                   ↘ ContextPropagator → DagOrchestrator
//! ```
//!
//! Nothing is global; two runtimes in one process share no state.

use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::application::agent_registry::{AgentRegistry, InitReport, RegistryError};
use crate::application::context_propagator::ContextPropagator;
use crate::application::orchestrator::{DagOrchestrator, RunHandle};
use crate::application::validation_engine::EventValidationEngine;
use crate::domain::agent::{Agent, AgentDescriptor, AgentId};
use crate::domain::coordinator_config::CoordinatorConfig;
use crate::domain::workflow::{RunReport, WorkflowDefinition, WorkflowError};
use crate::infrastructure::event_bus::{EventBus, PublishReceipt};
use crate::infrastructure::schema_registry::SchemaRegistry;

pub struct CoordinationRuntime {
    config: CoordinatorConfig,
    bus: Arc<EventBus>,
    agents: Arc<AgentRegistry>,
    propagator: Arc<ContextPropagator>,
    orchestrator: DagOrchestrator,
    shutdown: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl CoordinationRuntime {
    /// Runtime with the built-in schema set.
    pub fn new(config: CoordinatorConfig) -> Self {
        Self::with_schemas(config, SchemaRegistry::with_builtin_schemas())
    }

    /// Runtime validating against `schemas`. Register custom event types on
    /// the registry before handing it over; it is read-only afterwards.
    /// Canonical types the registry lacks get their built-in schema, so the
    /// runtime's own coordination events are never treated as unknown.
    pub fn with_schemas(config: CoordinatorConfig, mut schemas: SchemaRegistry) -> Self {
        schemas.ensure_builtin_schemas();
        let spec = &config.spec;
        let engine = Arc::new(EventValidationEngine::new(
            Arc::new(schemas),
            spec.validation.cache_capacity,
        ));
        let bus = Arc::new(EventBus::new(
            engine,
            spec.bus.history_capacity,
            spec.bus.notice_capacity,
        ));
        let agents = Arc::new(AgentRegistry::new(Arc::clone(&bus)));
        let propagator = Arc::new(ContextPropagator::new(
            Arc::clone(&bus),
            Arc::clone(&agents),
            spec.context.default_ttl,
        ));
        let orchestrator = DagOrchestrator::new(
            Arc::clone(&bus),
            Arc::clone(&agents),
            Arc::clone(&propagator),
            spec.orchestrator.clone(),
        );

        Self {
            config,
            bus,
            agents,
            propagator,
            orchestrator,
            shutdown: CancellationToken::new(),
            sweeper: Mutex::new(None),
        }
    }

    pub fn register_agent(&self, agent: Arc<dyn Agent>) -> Result<AgentDescriptor, RegistryError> {
        self.agents.register(agent)
    }

    /// Initialize every registered agent and start the slice sweeper.
    pub async fn start(&self) -> InitReport {
        let report = self.agents.initialize_all().await;

        let mut sweeper = self.sweeper.lock();
        if sweeper.is_none() {
            *sweeper = Some(
                self.propagator
                    .spawn_sweeper(self.config.spec.context.sweep_interval, self.shutdown.child_token()),
            );
        }
        drop(sweeper);

        info!(
            name = %self.config.metadata.name,
            agents = self.agents.len(),
            ready = report.ready.len(),
            "Coordination runtime started"
        );
        report
    }

    /// Stop the sweeper and shut every agent down.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let sweeper = self.sweeper.lock().take();
        if let Some(handle) = sweeper {
            let _ = handle.await;
        }
        self.agents.shutdown_all().await;
        info!(name = %self.config.metadata.name, "Coordination runtime stopped");
    }

    pub async fn publish(&self, event_type: &str, payload: Value, source: AgentId) -> PublishReceipt {
        self.bus.publish(event_type, payload, source).await
    }

    pub fn start_workflow(&self, definition: WorkflowDefinition, input: Value) -> Result<RunHandle, WorkflowError> {
        self.orchestrator.start(definition, input)
    }

    pub async fn run_workflow(&self, definition: WorkflowDefinition, input: Value) -> Result<RunReport, WorkflowError> {
        self.orchestrator.run(definition, input).await
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn agents(&self) -> &Arc<AgentRegistry> {
        &self.agents
    }

    pub fn propagator(&self) -> &Arc<ContextPropagator> {
        &self.propagator
    }

    pub fn orchestrator(&self) -> &DagOrchestrator {
        &self.orchestrator
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::agent::{
        AgentError, AgentLifecycleStatus, AgentStatusReport, AgentStatusTracker, HandledResult,
    };
    use crate::domain::events::DeliveredEvent;
    use async_trait::async_trait;
    use serde_json::json;

    struct Echo {
        id: AgentId,
        tracker: AgentStatusTracker,
    }

    #[async_trait]
    impl Agent for Echo {
        fn id(&self) -> &AgentId {
            &self.id
        }

        async fn initialize(&self) -> Result<(), AgentError> {
            self.tracker.mark_ready();
            Ok(())
        }

        async fn handle_event(&self, event: &DeliveredEvent) -> Result<HandledResult, AgentError> {
            Ok(HandledResult::with_output(event.payload().clone()))
        }

        fn status(&self) -> AgentStatusReport {
            self.tracker.report()
        }

        async fn shutdown(&self) {
            self.tracker.mark_stopped();
        }
    }

    #[tokio::test]
    async fn test_start_and_shutdown_drive_agent_lifecycle() {
        let runtime = CoordinationRuntime::new(CoordinatorConfig::default());
        let id = AgentId::new("echo");
        runtime
            .register_agent(Arc::new(Echo {
                id: id.clone(),
                tracker: AgentStatusTracker::new(),
            }))
            .unwrap();

        let report = runtime.start().await;
        assert!(report.all_ready());
        assert_eq!(
            runtime.agents().descriptor(&id).unwrap().status.status,
            AgentLifecycleStatus::Ready
        );

        runtime.shutdown().await;
        assert_eq!(
            runtime.agents().descriptor(&id).unwrap().status.status,
            AgentLifecycleStatus::Stopped
        );
    }

    #[tokio::test]
    async fn test_custom_registry_keeps_coordination_types_known() {
        let runtime = CoordinationRuntime::with_schemas(CoordinatorConfig::default(), SchemaRegistry::new());
        let receipt = runtime
            .publish("workflow.phase.start", json!({ "run_id": "r", "phase": "p" }), AgentId::new("t"))
            .await;
        assert_eq!(receipt.event_type, "workflow.phase.execute");
        assert!(!receipt.unknown);
        assert!(receipt.is_delivered());
    }

    #[tokio::test]
    async fn test_runtimes_share_no_state() {
        let first = CoordinationRuntime::new(CoordinatorConfig::default());
        let second = CoordinationRuntime::new(CoordinatorConfig::default());
        first
            .register_agent(Arc::new(Echo {
                id: AgentId::new("echo"),
                tracker: AgentStatusTracker::new(),
            }))
            .unwrap();

        let receipt = second
            .publish("workflow.phase.execute", json!({ "run_id": "r", "phase": "p" }), AgentId::new("t"))
            .await;
        assert!(receipt.deliveries().is_empty());
        assert_eq!(second.agents().len(), 0);
        assert_eq!(second.bus().history().len(), 1);
    }
}
