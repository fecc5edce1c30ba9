//! Deterministic bounded integer local search; the always-available fallback solver.

use std::collections::BTreeMap;

use async_trait::async_trait;
use hso_contracts::{
    Confidence, Constraints, Deadline, Model, Plan, SolverKind, now_wallclock_ms,
};
use tracing::debug;

use crate::error::SolverError;
use crate::solver::{SolveRequest, SolverAdapter};

/// Weight applied to total constraint violation in the penalized objective.
pub(crate) const PENALTY: f64 = 1.0e6;

#[derive(Debug, Clone)]
pub struct ClassicalSolver {
    id: String,
    tolerance: f64,
    max_iterations: u64,
}

impl Default for ClassicalSolver {
    fn default() -> Self {
        Self {
            id: "csa".into(),
            tolerance: 1e-6,
            max_iterations: 100_000,
        }
    }
}

impl ClassicalSolver {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: u64) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Minimize `model` subject to `constraints`.
    ///
    /// Coordinate descent over a penalized objective with shrinking step sizes. The
    /// search order is fixed, so identical inputs always produce the same plan. When the
    /// deadline hits first the best feasible assignment so far is returned as
    /// [`Confidence::Partial`].
    pub fn solve(
        &self,
        model: &Model,
        constraints: &Constraints,
        deadline: Deadline,
    ) -> Result<Plan, SolverError> {
        let mut current: BTreeMap<String, i64> = model
            .variables
            .iter()
            .map(|v| (v.name.clone(), v.bounds().0))
            .collect();
        let mut current_score = self.score(model, constraints, &current);
        let mut best_feasible = self.feasible_objective(model, constraints, &current);

        let max_range = model
            .variables
            .iter()
            .map(|v| {
                let (lower, upper) = v.bounds();
                upper.saturating_sub(lower)
            })
            .max()
            .unwrap_or(0);
        let mut step = (max_range / 2).max(1);
        let moves = neighbourhood(model.variables.len());
        let mut iterations = 0u64;
        let mut converged = false;

        while iterations < self.max_iterations {
            if deadline.is_expired() {
                break;
            }
            iterations += 1;

            let mut improved = false;
            for step_move in &moves {
                let mut candidate = current.clone();
                let mut changed = false;
                for &(index, sign) in step_move {
                    let var = &model.variables[index];
                    let value = current[&var.name];
                    let (lower, upper) = var.bounds();
                    let next = value.saturating_add(sign * step).clamp(lower, upper);
                    changed |= next != value;
                    candidate.insert(var.name.clone(), next);
                }
                if !changed {
                    continue;
                }
                let score = self.score(model, constraints, &candidate);
                if score + self.tolerance < current_score {
                    current = candidate;
                    current_score = score;
                    improved = true;
                    if let Some((objective, assignment)) =
                        self.feasible_objective(model, constraints, &current)
                    {
                        if best_feasible
                            .as_ref()
                            .is_none_or(|(best, _)| objective < *best)
                        {
                            best_feasible = Some((objective, assignment));
                        }
                    }
                }
            }

            if !improved {
                if step == 1 {
                    converged = true;
                    break;
                }
                step = (step / 2).max(1);
            }
        }

        debug!(solver = %self.id, iterations, converged, "classical search finished");
        let Some((objective_value, assignment)) = best_feasible else {
            return if converged || iterations >= self.max_iterations {
                Err(SolverError::Infeasible {
                    solver: self.id.clone(),
                })
            } else {
                Err(SolverError::Timeout {
                    solver: self.id.clone(),
                    budget_ms: deadline.budget_ms(),
                })
            };
        };
        Ok(Plan {
            source: SolverKind::Classical,
            solver_id: self.id.clone(),
            objective_value,
            confidence: if converged || iterations >= self.max_iterations {
                Confidence::Complete
            } else {
                Confidence::Partial
            },
            seed: None,
            produced_at_ms: now_wallclock_ms(),
            assignment,
        })
    }

    fn score(&self, model: &Model, constraints: &Constraints, a: &BTreeMap<String, i64>) -> f64 {
        model.objective(a) + PENALTY * constraints.total_violation(a, self.tolerance)
    }

    fn feasible_objective(
        &self,
        model: &Model,
        constraints: &Constraints,
        a: &BTreeMap<String, i64>,
    ) -> Option<(f64, BTreeMap<String, i64>)> {
        constraints
            .is_feasible(a, self.tolerance)
            .then(|| (model.objective(a), a.clone()))
    }
}

/// Single-variable steps in both directions, then pairwise transfers between variables.
fn neighbourhood(n: usize) -> Vec<Vec<(usize, i64)>> {
    let mut moves = Vec::with_capacity(2 * n + n * n.saturating_sub(1));
    for i in 0..n {
        moves.push(vec![(i, -1)]);
        moves.push(vec![(i, 1)]);
    }
    for i in 0..n {
        for j in 0..n {
            if i != j {
                moves.push(vec![(i, 1), (j, -1)]);
            }
        }
    }
    moves
}

#[async_trait]
impl SolverAdapter for ClassicalSolver {
    fn kind(&self) -> SolverKind {
        SolverKind::Classical
    }

    fn id(&self) -> &str {
        &self.id
    }

    async fn solve(&self, request: SolveRequest) -> Result<Plan, SolverError> {
        let solver = self.clone();
        let id = self.id.clone();
        tokio::task::spawn_blocking(move || {
            solver.solve(
                &request.problem.model,
                &request.problem.constraints,
                request.deadline,
            )
        })
        .await
        .map_err(|err| SolverError::Failed {
            solver: id,
            reason: format!("solver task panicked: {err}"),
        })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hso_contracts::{ConstraintSense, LinearConstraint, Variable};
    use std::time::Duration;

    /// Cover demand of 10 with two generators; `b` is cheaper per unit.
    pub(crate) fn dispatch_problem() -> (Model, Constraints) {
        let model = Model {
            name: "dispatch".into(),
            variables: vec![
                Variable::new("a", 0, 10, 3.0),
                Variable::new("b", 0, 6, 2.0),
            ],
        };
        let constraints = Constraints {
            rows: vec![LinearConstraint {
                name: "demand".into(),
                coefficients: [("a".to_string(), 1.0), ("b".to_string(), 1.0)].into(),
                sense: ConstraintSense::Ge,
                bound: 10.0,
            }],
        };
        (model, constraints)
    }

    #[test]
    fn finds_cheapest_feasible_dispatch() {
        let (model, constraints) = dispatch_problem();
        let plan = ClassicalSolver::default()
            .solve(&model, &constraints, Deadline::after(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(plan.assignment["b"], 6);
        assert_eq!(plan.assignment["a"], 4);
        assert_eq!(plan.objective_value, 24.0);
        assert_eq!(plan.confidence, Confidence::Complete);
        assert_eq!(plan.source, SolverKind::Classical);
    }

    #[test]
    fn deterministic_objective() {
        let (model, constraints) = dispatch_problem();
        let solver = ClassicalSolver::default();
        let a = solver
            .solve(&model, &constraints, Deadline::after_ms(5_000))
            .unwrap();
        let b = solver
            .solve(&model, &constraints, Deadline::after_ms(5_000))
            .unwrap();
        assert_eq!(a.objective_value, b.objective_value);
        assert_eq!(a.assignment, b.assignment);
    }

    #[test]
    fn expired_deadline_without_feasible_point_times_out() {
        let (model, constraints) = dispatch_problem();
        let err = ClassicalSolver::default()
            .solve(&model, &constraints, Deadline::after(Duration::ZERO))
            .unwrap_err();
        assert!(matches!(err, SolverError::Timeout { .. }));
    }

    #[test]
    fn expired_deadline_with_feasible_start_is_partial() {
        let model = Model {
            name: "trivial".into(),
            variables: vec![Variable::new("x", 2, 8, 1.0)],
        };
        let plan = ClassicalSolver::default()
            .solve(&model, &Constraints::default(), Deadline::after(Duration::ZERO))
            .unwrap();
        assert_eq!(plan.confidence, Confidence::Partial);
        assert_eq!(plan.assignment["x"], 2);
    }

    #[test]
    fn inverted_bounds_are_normalised() {
        let model = Model {
            name: "inverted".into(),
            variables: vec![Variable::new("x", 8, 2, 1.0)],
        };
        let plan = ClassicalSolver::default()
            .solve(&model, &Constraints::default(), Deadline::after_ms(5_000))
            .unwrap();
        assert_eq!(plan.assignment["x"], 2);
        assert_eq!(plan.confidence, Confidence::Complete);
    }

    #[test]
    fn full_range_bounds_do_not_overflow() {
        let model = Model {
            name: "wide".into(),
            variables: vec![
                Variable::new("x", i64::MIN, i64::MAX, 1.0),
                Variable::new("y", i64::MAX, i64::MIN, 0.0),
            ],
        };
        let plan = ClassicalSolver::default()
            .solve(&model, &Constraints::default(), Deadline::after_ms(5_000))
            .unwrap();
        assert_eq!(plan.assignment["x"], i64::MIN);
        assert_eq!(plan.assignment["y"], i64::MIN);
        assert_eq!(plan.confidence, Confidence::Complete);
    }

    #[test]
    fn infeasible_model_is_reported() {
        let model = Model {
            name: "impossible".into(),
            variables: vec![Variable::new("x", 0, 3, 1.0)],
        };
        let constraints = Constraints {
            rows: vec![LinearConstraint {
                name: "too-much".into(),
                coefficients: [("x".to_string(), 1.0)].into(),
                sense: ConstraintSense::Ge,
                bound: 10.0,
            }],
        };
        let err = ClassicalSolver::default()
            .solve(&model, &constraints, Deadline::after_ms(5_000))
            .unwrap_err();
        assert!(matches!(err, SolverError::Infeasible { .. }));
    }
}
