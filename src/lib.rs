//! SIEM Agent: endpoint event collection and delivery.
//!
//! Modular structure:
//! - [`collectors`]: per-channel event-log loops and installer detection
//! - [`normalizer`]: event XML to the canonical [`Event`]
//! - [`queue`] and [`sender`]: bounded buffering and batched delivery with retry
//! - [`registration`], [`inventory`], [`scripts`]: server-facing periodic units
//! - [`protection`]: file integrity, ACL hardening and service watch
//! - [`lifecycle`]: start/stop orchestration
//! - [`platform`]: OS adapters behind traits
//! - [`logging`]: structured JSON logging

pub mod client;
pub mod collectors;
pub mod config;
pub mod event;
pub mod inventory;
pub mod lifecycle;
pub mod logging;
pub mod normalizer;
pub mod platform;
pub mod protection;
pub mod queue;
pub mod registration;
pub mod scripts;
pub mod sender;
pub mod state;

#[cfg(test)]
mod testing;

pub use client::{ClientError, HttpServerApi, ServerApi};
pub use collectors::{Collector, EventInspector, HostContext, SoftwareControl};
pub use config::AgentConfig;
pub use event::{Event, EventBatch, Severity};
pub use lifecycle::{Agent, AgentPorts, AgentState, LifecycleError};
pub use logging::StructuredLogger;
pub use normalizer::Normalizer;
pub use queue::{EventQueue, QueueConsumer, QueueProducer};
pub use sender::{BatchSender, FlushOutcome};
pub use state::{SharedState, Stats};
