//! Core domain models for the Overseer orchestration engine
//!
//! This crate holds the plain data and pure logic of the engine: messages
//! and their addressing, agent records, blockers, resolution strategies,
//! the pattern classifier, project health snapshots, and configuration.
//! Nothing here is async or shared; the `overseer-engine` crate owns state
//! and concurrency.

pub mod agent;
pub mod blocker;
pub mod classifier;
pub mod config;
pub mod error;
pub mod event;
pub mod health;
pub mod message;
pub mod strategy;
pub mod weights;

pub use error::{Error, Result};
