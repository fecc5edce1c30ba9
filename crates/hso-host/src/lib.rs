//! Cycle scheduler host for the hybrid solver orchestration loop.
//!
//! [`CycleScheduler`] drives one Solve → Federate → Forecast → Commit cycle per
//! registered domain on every tick, under a hard per-cycle deadline.

pub mod config;
pub mod domain;
pub mod error;
mod pipeline;
pub mod scheduler;

#[cfg(feature = "test-fixtures")]
pub mod fixtures;

pub use config::{AdmissionConfig, OrchestratorConfig, QuantumConfig, QuorumConfig};
pub use domain::{DomainSpec, ProblemInstance, ProblemSource, StaticProblem};
pub use error::HostError;
pub use scheduler::{CycleScheduler, SchedulerBuilder, SchedulerStats};
