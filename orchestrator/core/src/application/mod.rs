// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod agent_registry;
pub mod consensus;
pub mod context_propagator;
pub mod orchestrator;
pub mod validation_engine;

pub use agent_registry::{AgentRegistry, InitReport, RegistryError};
pub use consensus::{Ballot, ConsensusGate};
pub use context_propagator::ContextPropagator;
pub use orchestrator::{DagOrchestrator, RunHandle};
pub use validation_engine::{CacheStats, EventValidationEngine, ValidationOutcome};
