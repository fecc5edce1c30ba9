use hso_contracts::{StageError, StageKind};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SolverError {
    #[error("solver '{solver}' timed out after {budget_ms}ms")]
    Timeout { solver: String, budget_ms: u64 },
    #[error("solver '{solver}' was not admitted: {reason}")]
    Rejected { solver: String, reason: String },
    #[error("solver '{solver}' was aborted")]
    Aborted { solver: String },
    #[error("solver '{solver}' found no feasible assignment")]
    Infeasible { solver: String },
    #[error("solver '{solver}' failed: {reason}")]
    Failed { solver: String, reason: String },
}

impl SolverError {
    pub fn solver(&self) -> &str {
        match self {
            SolverError::Timeout { solver, .. }
            | SolverError::Rejected { solver, .. }
            | SolverError::Aborted { solver }
            | SolverError::Infeasible { solver }
            | SolverError::Failed { solver, .. } => solver,
        }
    }

    /// Admission rejection and abort both count as a timeout of the solve stage.
    pub fn to_stage_error(&self, budget_ms: u64) -> StageError {
        match self {
            SolverError::Timeout { solver, budget_ms } => StageError::SolverTimeout {
                solver: solver.clone(),
                budget_ms: *budget_ms,
            },
            SolverError::Rejected { solver, .. } | SolverError::Aborted { solver } => {
                StageError::SolverTimeout {
                    solver: solver.clone(),
                    budget_ms,
                }
            }
            other => StageError::SolverFailed {
                solver: other.solver().to_string(),
                reason: other.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FederationError {
    #[error("quorum not reached: {collected}/{required} valid signatures")]
    QuorumNotReached { required: usize, collected: usize },
    #[error("high-impact allocation needs two dual-control signers, got {collected}")]
    DualControlMissing { collected: usize },
    #[error("allocation has no assets")]
    NoAssets,
    #[error("plan could not be hashed: {0}")]
    PlanHash(String),
}

impl FederationError {
    pub fn to_stage_error(&self, required: usize) -> StageError {
        match self {
            FederationError::QuorumNotReached { required, collected } => {
                StageError::QuorumNotReached {
                    required: *required,
                    collected: *collected,
                }
            }
            FederationError::DualControlMissing { collected } => StageError::QuorumNotReached {
                required,
                collected: *collected,
            },
            other => StageError::Stage {
                stage: StageKind::Federate,
                reason: other.to_string(),
            },
        }
    }
}

#[derive(Debug, Error)]
pub enum ForecastError {
    #[error("forecast did not finish within {budget_ms}ms")]
    Timeout { budget_ms: u64 },
    #[error("forecast field is {age_ms}ms old (bound {bound_ms}ms)")]
    Stale { age_ms: u64, bound_ms: u64 },
    #[error("invalid past window: {start_ms}..{end_ms}")]
    InvalidWindow { start_ms: u64, end_ms: u64 },
    #[error("forecast source failed: {0}")]
    Source(#[from] anyhow::Error),
}

impl ForecastError {
    pub fn to_stage_error(&self) -> StageError {
        match self {
            ForecastError::Stale { age_ms, bound_ms } => StageError::StaleField {
                age_ms: *age_ms,
                bound_ms: *bound_ms,
            },
            other => StageError::Stage {
                stage: StageKind::Forecast,
                reason: other.to_string(),
            },
        }
    }
}
