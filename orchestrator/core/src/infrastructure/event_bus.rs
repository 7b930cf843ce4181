// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Event Bus Implementation - In-process Pub/Sub for Coordination Events
//
// Every publish runs through the validation engine before any handler sees
// it. Valid events fan out to the subscribers of their canonical type, one
// handler at a time in registration order; invalid events are replaced by a
// `validation.failed` event on the internal path.
//
// Observers (CLI, tests, dashboards) follow a separate tokio broadcast stream
// of `CoordinationNotice`s. History is an in-memory ring buffer.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::application::validation_engine::EventValidationEngine;
use crate::domain::agent::{AgentError, AgentId, HandledResult};
use crate::domain::events::event_types::VALIDATION_FAILED;
use crate::domain::events::{
    CanonicalEvent, CoordinationNotice, CorrelationId, DeliveredEvent, Event, TraceId,
    ValidationFailed,
};
use crate::domain::schema::FieldError;

/// Callback invoked for each delivered event.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: Arc<DeliveredEvent>) -> Result<HandledResult, AgentError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Arc<DeliveredEvent>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<HandledResult, AgentError>> + Send + 'static,
{
    async fn handle(&self, event: Arc<DeliveredEvent>) -> Result<HandledResult, AgentError> {
        (self.0)(event).await
    }
}

/// Wrap an async closure as an [`EventHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Arc<DeliveredEvent>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<HandledResult, AgentError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Returned by [`EventBus::subscribe`]; pass back to [`EventBus::unsubscribe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    pub id: SubscriptionId,
    /// Routing key the subscription is stored under.
    pub event_type: String,
    pub agent_id: AgentId,
}

#[derive(Clone)]
struct Subscription {
    id: SubscriptionId,
    agent_id: AgentId,
    handler: Arc<dyn EventHandler>,
}

/// An event as handed to [`EventBus::dispatch`].
#[derive(Debug, Clone)]
pub struct OutboundEvent {
    pub event_type: String,
    pub payload: Value,
    pub source_agent: AgentId,
    /// Reuse an existing trace; a fresh one is assigned when absent.
    pub trace_id: Option<TraceId>,
    pub correlation_id: Option<CorrelationId>,
    pub target: Option<BTreeSet<AgentId>>,
}

impl OutboundEvent {
    pub fn new(event_type: impl Into<String>, payload: Value, source_agent: AgentId) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            source_agent,
            trace_id: None,
            correlation_id: None,
            target: None,
        }
    }

    pub fn with_trace(mut self, trace_id: TraceId) -> Self {
        self.trace_id = Some(trace_id);
        self
    }

    pub fn with_correlation(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn to_agents<I: IntoIterator<Item = AgentId>>(mut self, agents: I) -> Self {
        self.target = Some(agents.into_iter().collect());
        self
    }

    pub fn to_agent(self, agent: AgentId) -> Self {
        self.to_agents([agent])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum DeliveryResult {
    Handled(HandledResult),
    /// The handler returned an error or panicked.
    Faulted { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryOutcome {
    pub agent_id: AgentId,
    pub result: DeliveryResult,
}

impl DeliveryOutcome {
    pub fn handled(&self) -> Option<&HandledResult> {
        match &self.result {
            DeliveryResult::Handled(result) => Some(result),
            DeliveryResult::Faulted { .. } => None,
        }
    }

    pub fn is_fault(&self) -> bool {
        matches!(self.result, DeliveryResult::Faulted { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PublishStatus {
    Delivered { deliveries: Vec<DeliveryOutcome> },
    Rejected { errors: Vec<FieldError> },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublishReceipt {
    pub trace_id: TraceId,
    /// Normalized event type.
    pub event_type: String,
    pub unknown: bool,
    pub status: PublishStatus,
}

impl PublishReceipt {
    pub fn is_delivered(&self) -> bool {
        matches!(self.status, PublishStatus::Delivered { .. })
    }

    pub fn deliveries(&self) -> &[DeliveryOutcome] {
        match &self.status {
            PublishStatus::Delivered { deliveries } => deliveries,
            PublishStatus::Rejected { .. } => &[],
        }
    }

    pub fn errors(&self) -> &[FieldError] {
        match &self.status {
            PublishStatus::Rejected { errors } => errors,
            PublishStatus::Delivered { .. } => &[],
        }
    }

    pub fn delivery_to(&self, agent: &AgentId) -> Option<&DeliveryOutcome> {
        self.deliveries().iter().find(|d| &d.agent_id == agent)
    }

    pub fn faults(&self) -> impl Iterator<Item = &DeliveryOutcome> {
        self.deliveries().iter().filter(|d| d.is_fault())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum HistoryOutcome {
    Delivered { handlers: usize, faults: usize },
    Rejected { errors: Vec<FieldError> },
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryRecord {
    pub event: Event,
    pub outcome: HistoryOutcome,
    pub recorded_at: DateTime<Utc>,
}

/// Event bus for publishing and subscribing to coordination events
pub struct EventBus {
    engine: Arc<EventValidationEngine>,
    subscriptions: RwLock<HashMap<String, Vec<Subscription>>>,
    next_subscription: AtomicU64,
    history: Mutex<VecDeque<HistoryRecord>>,
    history_capacity: usize,
    notices: broadcast::Sender<CoordinationNotice>,
}

impl EventBus {
    /// `history_capacity` bounds the ring buffer, `notice_capacity` the
    /// observer channel before slow observers start lagging.
    pub fn new(
        engine: Arc<EventValidationEngine>,
        history_capacity: usize,
        notice_capacity: usize,
    ) -> Self {
        let (notices, _) = broadcast::channel(notice_capacity.max(1));
        Self {
            engine,
            subscriptions: RwLock::new(HashMap::new()),
            next_subscription: AtomicU64::new(1),
            history: Mutex::new(VecDeque::with_capacity(history_capacity)),
            history_capacity,
            notices,
        }
    }

    pub fn engine(&self) -> &EventValidationEngine {
        &self.engine
    }

    /// Register `handler` for events of `event_type` (raw or canonical).
    pub fn subscribe(
        &self,
        agent_id: AgentId,
        event_type: &str,
        handler: Arc<dyn EventHandler>,
    ) -> SubscriptionHandle {
        let (key, _) = self.engine.routing_key(event_type);
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));

        self.subscriptions
            .write()
            .entry(key.clone())
            .or_default()
            .push(Subscription {
                id,
                agent_id: agent_id.clone(),
                handler,
            });
        debug!(agent_id = %agent_id, event_type = %key, "Subscribed");

        SubscriptionHandle {
            id,
            event_type: key,
            agent_id,
        }
    }

    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let mut subscriptions = self.subscriptions.write();
        let Some(list) = subscriptions.get_mut(&handle.event_type) else {
            return false;
        };
        let before = list.len();
        list.retain(|s| s.id != handle.id);
        let removed = list.len() != before;
        if list.is_empty() {
            subscriptions.remove(&handle.event_type);
        }
        removed
    }

    /// Remove every subscription held by `agent_id`.
    pub fn unsubscribe_agent(&self, agent_id: &AgentId) -> usize {
        let mut subscriptions = self.subscriptions.write();
        let mut removed = 0;
        for list in subscriptions.values_mut() {
            let before = list.len();
            list.retain(|s| &s.agent_id != agent_id);
            removed += before - list.len();
        }
        subscriptions.retain(|_, list| !list.is_empty());
        removed
    }

    pub fn subscriber_count(&self, event_type: &str) -> usize {
        let (key, _) = self.engine.routing_key(event_type);
        self.subscriptions.read().get(&key).map(Vec::len).unwrap_or(0)
    }

    pub async fn publish(
        &self,
        event_type: &str,
        payload: Value,
        source_agent: AgentId,
    ) -> PublishReceipt {
        self.dispatch(OutboundEvent::new(event_type, payload, source_agent))
            .await
    }

    /// Validate, then deliver to every matching subscriber in registration order.
    pub async fn dispatch(&self, outbound: OutboundEvent) -> PublishReceipt {
        let trace_id = outbound.trace_id.unwrap_or_default();
        let outcome = self.engine.validate(&outbound.event_type, &outbound.payload);
        metrics::counter!("concord_events_published_total").increment(1);

        let event = Event {
            event_type: outcome.normalized_type.clone(),
            payload: outcome.normalized_payload.clone(),
            source_agent: outbound.source_agent,
            trace_id,
            correlation_id: outbound.correlation_id,
            target: outbound.target,
            timestamp: Utc::now(),
        };

        let body = match (&outcome.body, outcome.is_valid) {
            (Some(body), true) => body.clone(),
            _ => {
                self.reject(event, outcome.errors.clone()).await;
                return PublishReceipt {
                    trace_id,
                    event_type: outcome.normalized_type.clone(),
                    unknown: outcome.unknown,
                    status: PublishStatus::Rejected {
                        errors: outcome.errors.clone(),
                    },
                };
            }
        };

        if outcome.unknown {
            debug!(trace_id = %trace_id, event_type = %event.event_type, "Routing unknown event type");
        }

        let deliveries = self.deliver(Arc::new(DeliveredEvent { event, body })).await;
        PublishReceipt {
            trace_id,
            event_type: outcome.normalized_type.clone(),
            unknown: outcome.unknown,
            status: PublishStatus::Delivered { deliveries },
        }
    }

    /// Record the rejection and emit `validation.failed` on the internal path.
    async fn reject(&self, event: Event, errors: Vec<FieldError>) {
        warn!(
            trace_id = %event.trace_id,
            event_type = %event.event_type,
            errors = ?errors.iter().map(ToString::to_string).collect::<Vec<_>>(),
            "Event failed validation"
        );
        metrics::counter!("concord_events_rejected_total").increment(1);
        self.notify(CoordinationNotice::EventRejected {
            trace_id: event.trace_id,
            event_type: event.event_type.clone(),
            errors: errors.clone(),
            rejected_at: Utc::now(),
        });

        let failure = ValidationFailed {
            original_type: event.event_type.clone(),
            errors: errors.clone(),
        };
        let payload = serde_json::to_value(&failure).unwrap_or_else(|e| {
            warn!(trace_id = %event.trace_id, error = %e, "Could not encode validation failure payload");
            Value::Null
        });
        let error_event = Event {
            event_type: VALIDATION_FAILED.to_string(),
            payload,
            source_agent: AgentId::runtime(),
            trace_id: event.trace_id,
            correlation_id: event.correlation_id,
            target: None,
            timestamp: Utc::now(),
        };

        self.record(event, HistoryOutcome::Rejected { errors });
        // Already well-formed: skips validation so error events cannot recurse.
        self.deliver(Arc::new(DeliveredEvent {
            event: error_event,
            body: CanonicalEvent::ValidationFailed(failure),
        }))
        .await;
    }

    async fn deliver(&self, delivered: Arc<DeliveredEvent>) -> Vec<DeliveryOutcome> {
        let event = &delivered.event;
        // Snapshot so no lock is held while handlers run.
        let targets: Vec<Subscription> = self
            .subscriptions
            .read()
            .get(&event.event_type)
            .map(|list| {
                list.iter()
                    .filter(|s| event.is_targeted_at(&s.agent_id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let mut deliveries = Vec::with_capacity(targets.len());
        for subscription in targets {
            let call = subscription.handler.handle(Arc::clone(&delivered));
            let result = match AssertUnwindSafe(call).catch_unwind().await {
                Ok(Ok(handled)) => DeliveryResult::Handled(handled),
                Ok(Err(e)) => DeliveryResult::Faulted {
                    reason: e.to_string(),
                },
                Err(panic) => DeliveryResult::Faulted {
                    reason: format!("handler panicked: {}", panic_message(panic.as_ref())),
                },
            };

            if let DeliveryResult::Faulted { reason } = &result {
                warn!(
                    trace_id = %event.trace_id,
                    event_type = %event.event_type,
                    agent_id = %subscription.agent_id,
                    reason = %reason,
                    "Event handler faulted"
                );
                metrics::counter!("concord_handler_faults_total").increment(1);
                self.notify(CoordinationNotice::HandlerFaulted {
                    trace_id: event.trace_id,
                    event_type: event.event_type.clone(),
                    agent_id: subscription.agent_id.clone(),
                    reason: reason.clone(),
                    faulted_at: Utc::now(),
                });
            }

            deliveries.push(DeliveryOutcome {
                agent_id: subscription.agent_id,
                result,
            });
        }

        let faults = deliveries.iter().filter(|d| d.is_fault()).count();
        debug!(
            trace_id = %event.trace_id,
            event_type = %event.event_type,
            handlers = deliveries.len(),
            faults,
            "Event delivered"
        );
        self.notify(CoordinationNotice::EventDelivered {
            trace_id: event.trace_id,
            event_type: event.event_type.clone(),
            handlers: deliveries.len(),
            delivered_at: Utc::now(),
        });
        self.record(
            event.clone(),
            HistoryOutcome::Delivered {
                handlers: deliveries.len(),
                faults,
            },
        );
        deliveries
    }

    fn record(&self, event: Event, outcome: HistoryOutcome) {
        if self.history_capacity == 0 {
            return;
        }
        let mut history = self.history.lock();
        while history.len() >= self.history_capacity {
            history.pop_front();
        }
        history.push_back(HistoryRecord {
            event,
            outcome,
            recorded_at: Utc::now(),
        });
    }

    /// Retained records, oldest first.
    pub fn history(&self) -> Vec<HistoryRecord> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn history_for(&self, trace_id: TraceId) -> Vec<HistoryRecord> {
        self.history
            .lock()
            .iter()
            .filter(|r| r.event.trace_id == trace_id)
            .cloned()
            .collect()
    }

    /// Publish a notice to observers. Having no observers is not an error.
    pub fn notify(&self, notice: CoordinationNotice) {
        if self.notices.send(notice).is_err() {
            debug!("No observers listening for coordination notices");
        }
    }

    /// Subscribe to the coordination notice stream.
    pub fn watch(&self) -> NoticeReceiver {
        NoticeReceiver {
            receiver: self.notices.subscribe(),
        }
    }

    pub fn observer_count(&self) -> usize {
        self.notices.receiver_count()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Receiver for coordination notices
pub struct NoticeReceiver {
    receiver: broadcast::Receiver<CoordinationNotice>,
}

impl NoticeReceiver {
    /// Receive the next notice (waits until one is available)
    pub async fn recv(&mut self) -> Result<CoordinationNotice, EventBusError> {
        self.receiver.recv().await.map_err(|e| match e {
            broadcast::error::RecvError::Closed => EventBusError::Closed,
            broadcast::error::RecvError::Lagged(n) => {
                warn!("Notice receiver lagged by {} notices", n);
                EventBusError::Lagged(n)
            }
        })
    }

    /// Try to receive a notice without waiting
    pub fn try_recv(&mut self) -> Result<CoordinationNotice, EventBusError> {
        self.receiver.try_recv().map_err(|e| match e {
            broadcast::error::TryRecvError::Empty => EventBusError::Empty,
            broadcast::error::TryRecvError::Closed => EventBusError::Closed,
            broadcast::error::TryRecvError::Lagged(n) => {
                warn!("Notice receiver lagged by {} notices", n);
                EventBusError::Lagged(n)
            }
        })
    }
}

/// Errors that can occur when receiving notices
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EventBusError {
    #[error("Event bus is closed")]
    Closed,

    #[error("No notices available")]
    Empty,

    #[error("Receiver lagged by {0} notices (notices were dropped)")]
    Lagged(u64),
}
