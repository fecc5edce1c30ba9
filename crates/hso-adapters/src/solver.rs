use std::sync::Arc;

use async_trait::async_trait;
use hso_contracts::{AbortSignal, Deadline, Envelope, Plan, Problem, SolverKind};
use tokio::time::timeout;

use crate::error::SolverError;

/// One solve call: the problem plus the envelope and deadline it travels under.
#[derive(Debug, Clone)]
pub struct SolveRequest {
    pub envelope: Envelope,
    pub problem: Arc<Problem>,
    pub deadline: Deadline,
    pub abort: AbortSignal,
}

#[async_trait]
pub trait SolverAdapter: Send + Sync {
    fn kind(&self) -> SolverKind;

    fn id(&self) -> &str;

    /// Produce a plan before `request.deadline`. Implementations may return early with a
    /// partial plan; the caller enforces the deadline regardless.
    async fn solve(&self, request: SolveRequest) -> Result<Plan, SolverError>;
}

/// Run `adapter` under the request deadline and abort signal.
///
/// Whichever comes first of completion, deadline expiry or abort wins; the losing
/// solve future is dropped.
pub async fn solve_within(
    adapter: &dyn SolverAdapter,
    request: SolveRequest,
) -> Result<Plan, SolverError> {
    let budget_ms = request.deadline.budget_ms();
    let remaining = request.deadline.remaining();
    let abort = request.abort.clone();
    let solver = adapter.id().to_string();
    tokio::select! {
        result = timeout(remaining, adapter.solve(request)) => match result {
            Ok(result) => result,
            Err(_) => Err(SolverError::Timeout { solver, budget_ms }),
        },
        _ = abort.aborted() => Err(SolverError::Aborted { solver }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockSolver;
    use hso_contracts::{AbortController, Constraints, Model};
    use std::time::Duration;

    fn request(budget_ms: u64, abort: AbortSignal) -> SolveRequest {
        SolveRequest {
            envelope: Envelope::builder("grid", "solve").build(),
            problem: Arc::new(Problem::new(
                Model {
                    name: "empty".into(),
                    variables: vec![],
                },
                Constraints::default(),
            )),
            deadline: Deadline::after_ms(budget_ms),
            abort,
        }
    }

    #[tokio::test]
    async fn slow_solver_times_out() {
        let solver = MockSolver::quantum(1.0, 0.9).with_latency(Duration::from_millis(500));
        let err = solve_within(&solver, request(20, AbortController::new().signal()))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            SolverError::Timeout {
                solver: "qsa-mock".into(),
                budget_ms: 20
            }
        );
    }

    #[tokio::test]
    async fn abort_cancels_in_flight_solve() {
        let solver = MockSolver::classical(1.0).with_latency(Duration::from_millis(500));
        let controller = AbortController::new();
        let req = request(1_000, controller.signal());
        let handle = tokio::spawn(async move { solve_within(&solver, req).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        controller.abort();
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, SolverError::Aborted { .. }));
    }

    #[tokio::test]
    async fn fast_solver_returns_plan() {
        let solver = MockSolver::classical(3.0);
        let plan = solve_within(&solver, request(100, AbortController::new().signal()))
            .await
            .unwrap();
        assert_eq!(plan.objective_value, 3.0);
        assert_eq!(solver.calls(), 1);
    }
}
