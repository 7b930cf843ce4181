// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Concord Core
//!
//! In-process runtime that coordinates independent agents: a validating
//! event bus, context propagation with TTL and priority rules, and a DAG
//! orchestrator with consensus gates.
//!
//! # Architecture
//!
//! - **domain:** events, schemas, context slices, workflow graphs and run state
//! - **application:** validation engine, agent registry, context propagator,
//!   consensus gate, DAG orchestrator
//! - **infrastructure:** event bus, schema registry, workflow parser
//! - [`runtime::CoordinationRuntime`] wires them together

pub mod application;
pub mod domain;
pub mod infrastructure;
pub mod runtime;

pub use runtime::CoordinationRuntime;
