// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Agent Registry
//!
//! Lookup table of the agents plugged into a runtime. Registering an agent
//! subscribes it on the bus to the runtime's own event types (context
//! updates, phase execution, vote requests) plus whatever it lists in
//! [`Agent::subscriptions`].

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::domain::agent::{Agent, AgentDescriptor, AgentError, AgentId, HandledResult};
use crate::domain::events::event_types::{CONTEXT_UPDATE, PHASE_EXECUTE, VOTE_REQUEST};
use crate::domain::events::DeliveredEvent;
use crate::infrastructure::event_bus::{EventBus, EventHandler, SubscriptionHandle};

/// Event types every registered agent receives.
pub const CORE_SUBSCRIPTIONS: &[&str] = &[CONTEXT_UPDATE, PHASE_EXECUTE, VOTE_REQUEST];

#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    #[error("Agent '{0}' is already registered")]
    Duplicate(AgentId),

    #[error("Agent '{0}' is not registered")]
    NotFound(AgentId),
}

/// Outcome of [`AgentRegistry::initialize_all`].
#[derive(Debug, Default)]
pub struct InitReport {
    pub ready: Vec<AgentId>,
    pub failed: Vec<(AgentId, AgentError)>,
}

impl InitReport {
    pub fn all_ready(&self) -> bool {
        self.failed.is_empty()
    }
}

struct AgentHandler {
    agent: Arc<dyn Agent>,
}

#[async_trait]
impl EventHandler for AgentHandler {
    async fn handle(&self, event: Arc<DeliveredEvent>) -> Result<HandledResult, AgentError> {
        self.agent.handle_event(&event).await
    }
}

struct RegisteredAgent {
    agent: Arc<dyn Agent>,
    handles: Vec<SubscriptionHandle>,
}

pub struct AgentRegistry {
    bus: Arc<EventBus>,
    agents: RwLock<BTreeMap<AgentId, RegisteredAgent>>,
}

impl AgentRegistry {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            bus,
            agents: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn register(&self, agent: Arc<dyn Agent>) -> Result<AgentDescriptor, RegistryError> {
        let id = agent.id().clone();
        let mut agents = self.agents.write();
        if agents.contains_key(&id) {
            return Err(RegistryError::Duplicate(id));
        }

        let mut keys = BTreeSet::new();
        let mut handles = Vec::new();
        let wanted = CORE_SUBSCRIPTIONS
            .iter()
            .map(|t| t.to_string())
            .chain(agent.subscriptions());
        for event_type in wanted {
            let (key, _) = self.bus.engine().routing_key(&event_type);
            if !keys.insert(key) {
                continue;
            }
            let handler = Arc::new(AgentHandler {
                agent: Arc::clone(&agent),
            });
            handles.push(self.bus.subscribe(id.clone(), &event_type, handler));
        }

        info!(agent_id = %id, subscriptions = handles.len(), "Agent registered");
        let descriptor = describe(agent.as_ref());
        agents.insert(id, RegisteredAgent { agent, handles });
        Ok(descriptor)
    }

    pub fn deregister(&self, id: &AgentId) -> Result<Arc<dyn Agent>, RegistryError> {
        let entry = self
            .agents
            .write()
            .remove(id)
            .ok_or_else(|| RegistryError::NotFound(id.clone()))?;
        for handle in &entry.handles {
            self.bus.unsubscribe(handle);
        }
        info!(agent_id = %id, "Agent deregistered");
        Ok(entry.agent)
    }

    pub fn get(&self, id: &AgentId) -> Option<Arc<dyn Agent>> {
        self.agents.read().get(id).map(|e| Arc::clone(&e.agent))
    }

    pub fn contains(&self, id: &AgentId) -> bool {
        self.agents.read().contains_key(id)
    }

    pub fn ids(&self) -> Vec<AgentId> {
        self.agents.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.agents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.read().is_empty()
    }

    pub fn descriptor(&self, id: &AgentId) -> Option<AgentDescriptor> {
        self.get(id).map(|agent| describe(agent.as_ref()))
    }

    pub fn descriptors(&self) -> Vec<AgentDescriptor> {
        self.snapshot().iter().map(|agent| describe(agent.as_ref())).collect()
    }

    /// Initialize every agent. Agents that fail stay registered but stop
    /// receiving events.
    pub async fn initialize_all(&self) -> InitReport {
        let mut report = InitReport::default();
        for agent in self.snapshot() {
            let id = agent.id().clone();
            match agent.initialize().await {
                Ok(()) => report.ready.push(id),
                Err(e) => {
                    warn!(agent_id = %id, error = %e, "Agent failed to initialize");
                    self.unsubscribe_all(&id);
                    report.failed.push((id, e));
                }
            }
        }
        info!(
            ready = report.ready.len(),
            failed = report.failed.len(),
            "Agent initialization complete"
        );
        report
    }

    pub async fn shutdown_all(&self) {
        for agent in self.snapshot() {
            agent.shutdown().await;
            self.unsubscribe_all(agent.id());
        }
        info!("All agents shut down");
    }

    fn unsubscribe_all(&self, id: &AgentId) {
        let handles = self
            .agents
            .write()
            .get_mut(id)
            .map(|entry| std::mem::take(&mut entry.handles))
            .unwrap_or_default();
        for handle in &handles {
            self.bus.unsubscribe(handle);
        }
    }

    /// Clone the agent list so no lock is held across `.await`.
    fn snapshot(&self) -> Vec<Arc<dyn Agent>> {
        self.agents
            .read()
            .values()
            .map(|e| Arc::clone(&e.agent))
            .collect()
    }
}

fn describe(agent: &dyn Agent) -> AgentDescriptor {
    AgentDescriptor {
        id: agent.id().clone(),
        capabilities: agent.capabilities(),
        status: agent.status(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::validation_engine::EventValidationEngine;
    use crate::domain::agent::{AgentLifecycleStatus, AgentStatusReport, AgentStatusTracker};
    use crate::domain::events::event_types::KNOWLEDGE_QUERY;
    use crate::infrastructure::schema_registry::SchemaRegistry;
    use serde_json::json;

    struct TestAgent {
        id: AgentId,
        fail_init: bool,
        tracker: AgentStatusTracker,
    }

    impl TestAgent {
        fn new(id: &str, fail_init: bool) -> Arc<Self> {
            Arc::new(Self {
                id: AgentId::new(id),
                fail_init,
                tracker: AgentStatusTracker::new(),
            })
        }
    }

    #[async_trait]
    impl Agent for TestAgent {
        fn id(&self) -> &AgentId {
            &self.id
        }

        fn subscriptions(&self) -> Vec<String> {
            vec!["knowledge.search".to_string(), KNOWLEDGE_QUERY.to_string()]
        }

        async fn initialize(&self) -> Result<(), AgentError> {
            if self.fail_init {
                self.tracker.mark_failed();
                return Err(AgentError::Init("no backend".to_string()));
            }
            self.tracker.mark_ready();
            Ok(())
        }

        async fn handle_event(&self, event: &DeliveredEvent) -> Result<HandledResult, AgentError> {
            self.tracker.record_event(event);
            Ok(HandledResult::ack())
        }

        fn status(&self) -> AgentStatusReport {
            self.tracker.report()
        }

        async fn shutdown(&self) {
            self.tracker.mark_stopped();
        }
    }

    fn registry() -> (Arc<EventBus>, AgentRegistry) {
        let engine = EventValidationEngine::new(Arc::new(SchemaRegistry::with_builtin_schemas()), 16);
        let bus = Arc::new(EventBus::new(Arc::new(engine), 16, 16));
        (Arc::clone(&bus), AgentRegistry::new(bus))
    }

    #[tokio::test]
    async fn test_register_subscribes_once_per_canonical_type() {
        let (bus, registry) = registry();
        registry.register(TestAgent::new("a", false)).unwrap();

        assert_eq!(bus.subscriber_count(KNOWLEDGE_QUERY), 1);
        assert_eq!(bus.subscriber_count(PHASE_EXECUTE), 1);
        assert!(matches!(
            registry.register(TestAgent::new("a", false)),
            Err(RegistryError::Duplicate(_))
        ));
    }

    #[tokio::test]
    async fn test_initialize_reports_failures_and_mutes_failed_agents() {
        let (bus, registry) = registry();
        registry.register(TestAgent::new("good", false)).unwrap();
        registry.register(TestAgent::new("bad", true)).unwrap();

        let report = registry.initialize_all().await;
        assert_eq!(report.ready, vec![AgentId::new("good")]);
        assert_eq!(report.failed.len(), 1);
        assert!(!report.all_ready());

        let receipt = bus
            .publish(KNOWLEDGE_QUERY, json!({ "query": "q" }), AgentId::new("p"))
            .await;
        assert_eq!(receipt.deliveries().len(), 1);
        assert_eq!(
            registry.descriptor(&AgentId::new("bad")).unwrap().status.status,
            AgentLifecycleStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_deregister_and_shutdown() {
        let (bus, registry) = registry();
        registry.register(TestAgent::new("a", false)).unwrap();
        registry.register(TestAgent::new("b", false)).unwrap();
        registry.initialize_all().await;

        registry.deregister(&AgentId::new("a")).unwrap();
        assert!(!registry.contains(&AgentId::new("a")));
        assert!(registry.deregister(&AgentId::new("a")).is_err());
        assert_eq!(bus.subscriber_count(KNOWLEDGE_QUERY), 1);

        registry.shutdown_all().await;
        assert_eq!(bus.subscriber_count(KNOWLEDGE_QUERY), 0);
        assert_eq!(
            registry.descriptors()[0].status.status,
            AgentLifecycleStatus::Stopped
        );
    }
}
