use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cycle::StageKind;

/// Classification of everything that can go wrong inside a cycle.
///
/// Only [`StageError::HashMismatch`] is fatal for a record; the rest either trigger a
/// fallback or downgrade the cycle.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum StageError {
    #[error("solver '{solver}' exceeded its {budget_ms}ms budget")]
    SolverTimeout { solver: String, budget_ms: u64 },
    #[error("solver '{solver}' failed: {reason}")]
    SolverFailed { solver: String, reason: String },
    #[error("quorum not reached: {collected}/{required} signatures")]
    QuorumNotReached { required: usize, collected: usize },
    #[error("forecast field is {age_ms}ms old (bound {bound_ms}ms)")]
    StaleField { age_ms: u64, bound_ms: u64 },
    #[error("hash mismatch: expected {expected}, recomputed {actual}")]
    HashMismatch { expected: String, actual: String },
    #[error("anchor submission failed: {reason}")]
    AnchorSubmission { reason: String },
    #[error("cycle deadline exhausted during {stage} ({budget_ms}ms budget)")]
    DeadlineExhausted { stage: StageKind, budget_ms: u64 },
    #[error("no plan available: {reason}")]
    NoPlan { reason: String },
    #[error("commit failed: {reason}")]
    Commit { reason: String },
    #[error("{stage} failed: {reason}")]
    Stage { stage: StageKind, reason: String },
}

impl StageError {
    /// Fatal for the record being committed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StageError::HashMismatch { .. })
    }

    /// Cycle ends `degraded` (retried next tick) rather than `failed`.
    pub fn degrades_cycle(&self) -> bool {
        matches!(
            self,
            StageError::QuorumNotReached { .. } | StageError::DeadlineExhausted { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        let mismatch = StageError::HashMismatch {
            expected: "a".into(),
            actual: "b".into(),
        };
        assert!(mismatch.is_fatal());
        assert!(!mismatch.degrades_cycle());
        assert!(
            StageError::QuorumNotReached {
                required: 2,
                collected: 1
            }
            .degrades_cycle()
        );
        let timeout = StageError::SolverTimeout {
            solver: "qsa".into(),
            budget_ms: 800,
        };
        assert!(!timeout.is_fatal() && !timeout.degrades_cycle());
        assert_eq!(
            StageError::DeadlineExhausted {
                stage: StageKind::Commit,
                budget_ms: 300
            }
            .to_string(),
            "cycle deadline exhausted during commit (300ms budget)"
        );
    }
}
