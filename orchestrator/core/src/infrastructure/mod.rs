// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod event_bus;
pub mod schema_registry;
pub mod workflow_parser;

pub use event_bus::{EventBus, EventBusError, EventHandler, OutboundEvent, PublishReceipt};
pub use schema_registry::{SchemaRegistry, SchemaRegistryError};
pub use workflow_parser::WorkflowParser;
