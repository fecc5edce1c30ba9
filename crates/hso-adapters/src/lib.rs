//! Backends the cycle scheduler talks to: solver adapters, the admission limiter,
//! federation, and forecasting.

pub mod admission;
pub mod chooser;
pub mod classical;
pub mod error;
pub mod federation;
pub mod forecast;
#[cfg(any(test, feature = "test-fixtures"))]
pub mod mock;
pub mod quantum;
pub mod solver;

pub use admission::{
    AdmissionError, AdmissionLimiter, AdmissionMode, AdmissionPermit, AdmissionStats,
};
pub use chooser::choose_better;
pub use classical::ClassicalSolver;
pub use error::{FederationError, ForecastError, SolverError};
pub use federation::{Acknowledgment, AllocationRequest, AssetRepresentative, FederationCoordinator};
pub use forecast::{
    FieldRefresh, ForecastEngine, ForecastSource, PersistenceForecaster, ensure_fresh,
};
pub use quantum::{AnnealStrategy, QuantumSolver};
pub use solver::{SolveRequest, SolverAdapter, solve_within};
