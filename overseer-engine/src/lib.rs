//! Services of the Overseer orchestration engine
//!
//! This crate wires the domain types of `overseer-core` into running
//! services: the A2A message router, the blocker resolver, the performance
//! scorer and the project health aggregator, all sharing one concurrent
//! store and one outcome event bus. [`orchestrator::Orchestrator`] is the
//! entry point that assembles them.

pub mod clock;
pub mod collaborators;
pub mod error;
pub mod events;
pub mod health;
pub mod orchestrator;
pub mod persistence;
pub mod resolver;
pub mod router;
pub mod scorer;
pub mod settings;
pub mod store;
pub mod telemetry;

pub use error::{Error, Result};
pub use orchestrator::{Orchestrator, OrchestratorBuilder};

/// Re-export core types for convenience
pub use overseer_core as core;
