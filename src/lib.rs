// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod config;
pub mod error;
pub mod rules;
pub mod schedule;
pub mod seen;

// Outbound side: sinks, per-destination delivery
pub mod dispatch;
pub mod notify;

// Inbound side: chat listener and feed pollers
pub mod ingest;
pub mod poller;

// Diagnostics
pub mod api;
pub mod metrics;

// ---- Re-exports for stable public API ----
pub use crate::api::router;
pub use crate::config::{load_routing_table, ConfigStore, Settings};
pub use crate::dispatch::{spawn_dispatch_router, DispatchQueue, Dispatcher, Payload};
pub use crate::ingest::{handle_inbound, InboundEvent};
pub use crate::rules::{Destination, RoutingTable, RuleEngine};
