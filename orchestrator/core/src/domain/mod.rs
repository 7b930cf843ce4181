// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain Layer
//!
//! Value types, invariants and pure state machines. Nothing in here performs
//! I/O or spawns tasks.

pub mod agent;
pub mod consensus;
pub mod context;
pub mod coordinator_config;
pub mod events;
pub mod normalizer;
pub mod schema;
pub mod workflow;
