//! Best-effort annealing backend standing in for a quantum optimizer.
//!
//! Results are reproducible for a given seed but carry a confidence score rather than
//! a completeness guarantee, and the scheduler never trusts them as the sole source.

use std::collections::BTreeMap;

use async_trait::async_trait;
use hso_contracts::{Confidence, Deadline, Plan, Problem, SolverKind, now_wallclock_ms};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::classical::PENALTY;
use crate::error::SolverError;
use crate::solver::{SolveRequest, SolverAdapter};

const AGREEMENT_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnnealStrategy {
    pub sweeps: u32,
    pub restarts: u32,
    pub initial_temperature: f64,
    pub cooling: f64,
}

impl Default for AnnealStrategy {
    fn default() -> Self {
        Self {
            sweeps: 4_000,
            restarts: 4,
            initial_temperature: 10.0,
            cooling: 0.995,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QuantumSolver {
    id: String,
    seed: u64,
    strategy: AnnealStrategy,
}

impl QuantumSolver {
    pub fn new(id: impl Into<String>, seed: u64) -> Self {
        Self {
            id: id.into(),
            seed,
            strategy: AnnealStrategy::default(),
        }
    }

    pub fn with_strategy(mut self, strategy: AnnealStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Anneal from `strategy.restarts` seeded starting points and keep the best feasible
    /// assignment. Confidence is the share of restarts that agree on the best objective,
    /// scaled by the share of the sweep budget that ran before the deadline.
    pub fn optimize(
        &self,
        problem: &Problem,
        deadline: Deadline,
        strategy: &AnnealStrategy,
    ) -> Result<Plan, SolverError> {
        let model = &problem.model;
        let tolerance = 1e-6;
        let score = |a: &BTreeMap<String, i64>| {
            model.objective(a) + PENALTY * problem.constraints.total_violation(a, tolerance)
        };

        let restarts = strategy.restarts.max(1);
        let planned = u64::from(restarts) * u64::from(strategy.sweeps.max(1));
        let mut executed = 0u64;
        let mut finals: Vec<f64> = Vec::new();
        let mut best: Option<(f64, BTreeMap<String, i64>)> = None;
        let mut expired = false;

        'restarts: for restart in 0..restarts {
            if deadline.is_expired() {
                expired = true;
                break;
            }
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(u64::from(restart)));
            let mut current: BTreeMap<String, i64> = model
                .variables
                .iter()
                .map(|v| {
                    let (lo, hi) = v.bounds();
                    (v.name.clone(), rng.gen_range(lo..=hi))
                })
                .collect();
            let mut current_score = score(&current);
            let mut restart_best: Option<f64> = None;
            if problem.constraints.is_feasible(&current, tolerance) {
                let objective = model.objective(&current);
                restart_best = Some(objective);
                if best.as_ref().is_none_or(|(b, _)| objective < *b) {
                    best = Some((objective, current.clone()));
                }
            }
            let mut temperature = strategy.initial_temperature.max(f64::MIN_POSITIVE);

            for _ in 0..strategy.sweeps.max(1) {
                if deadline.is_expired() {
                    expired = true;
                    break 'restarts;
                }
                executed += 1;
                if model.variables.is_empty() {
                    break;
                }
                let var = &model.variables[rng.gen_range(0..model.variables.len())];
                let (lower, upper) = var.bounds();
                let span = i64::try_from(upper.abs_diff(lower) / 4).unwrap_or(i64::MAX).max(1);
                let delta = rng.gen_range(-span..=span);
                let old = current[&var.name];
                let proposed = old.saturating_add(delta).clamp(lower, upper);
                if proposed == old {
                    continue;
                }
                current.insert(var.name.clone(), proposed);
                let next_score = score(&current);
                let diff = next_score - current_score;
                if diff <= 0.0 || rng.gen_range(0.0..1.0) < (-diff / temperature).exp() {
                    current_score = next_score;
                    if problem.constraints.is_feasible(&current, tolerance) {
                        let objective = model.objective(&current);
                        if restart_best.is_none_or(|b| objective < b) {
                            restart_best = Some(objective);
                        }
                        if best.as_ref().is_none_or(|(b, _)| objective < *b) {
                            best = Some((objective, current.clone()));
                        }
                    }
                } else {
                    current.insert(var.name.clone(), old);
                }
                temperature *= strategy.cooling;
            }
            if let Some(objective) = restart_best {
                finals.push(objective);
            }
        }

        debug!(solver = %self.id, executed, planned, expired, "annealing finished");
        let Some((objective_value, assignment)) = best else {
            return Err(if expired {
                SolverError::Timeout {
                    solver: self.id.clone(),
                    budget_ms: deadline.budget_ms(),
                }
            } else {
                SolverError::Infeasible {
                    solver: self.id.clone(),
                }
            });
        };

        let agreeing = finals
            .iter()
            .filter(|v| (**v - objective_value).abs() <= AGREEMENT_EPSILON)
            .count();
        let agreement = agreeing as f64 / f64::from(restarts);
        let completion = executed as f64 / planned as f64;
        Ok(Plan {
            source: SolverKind::Quantum,
            solver_id: self.id.clone(),
            objective_value,
            confidence: Confidence::Score((agreement * completion).clamp(0.0, 1.0)),
            seed: Some(self.seed),
            produced_at_ms: now_wallclock_ms(),
            assignment,
        })
    }
}

#[async_trait]
impl SolverAdapter for QuantumSolver {
    fn kind(&self) -> SolverKind {
        SolverKind::Quantum
    }

    fn id(&self) -> &str {
        &self.id
    }

    async fn solve(&self, request: SolveRequest) -> Result<Plan, SolverError> {
        let solver = self.clone();
        let id = self.id.clone();
        tokio::task::spawn_blocking(move || {
            solver.optimize(&request.problem, request.deadline, &solver.strategy)
        })
        .await
        .map_err(|err| SolverError::Failed {
            solver: id,
            reason: format!("annealer task panicked: {err}"),
        })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hso_contracts::{ConstraintSense, Constraints, LinearConstraint, Model, Variable};
    use std::time::Duration;

    fn problem() -> Problem {
        Problem::new(
            Model {
                name: "dispatch".into(),
                variables: vec![
                    Variable::new("a", 0, 10, 3.0),
                    Variable::new("b", 0, 6, 2.0),
                ],
            },
            Constraints {
                rows: vec![LinearConstraint {
                    name: "demand".into(),
                    coefficients: [("a".to_string(), 1.0), ("b".to_string(), 1.0)].into(),
                    sense: ConstraintSense::Ge,
                    bound: 10.0,
                }],
            },
        )
    }

    #[test]
    fn same_seed_same_plan() {
        let solver = QuantumSolver::new("qsa", 42);
        let strategy = AnnealStrategy::default();
        let a = solver
            .optimize(&problem(), Deadline::after_ms(10_000), &strategy)
            .unwrap();
        let b = solver
            .optimize(&problem(), Deadline::after_ms(10_000), &strategy)
            .unwrap();
        assert_eq!(a.assignment, b.assignment);
        assert_eq!(a.seed, Some(42));
        assert_eq!(a.source, SolverKind::Quantum);
        let score = a.confidence.score();
        assert!((0.0..=1.0).contains(&score));
    }

    #[test]
    fn finds_a_feasible_plan() {
        let plan = QuantumSolver::new("qsa", 7)
            .optimize(&problem(), Deadline::after_ms(10_000), &AnnealStrategy::default())
            .unwrap();
        let p = problem();
        assert!(p.constraints.is_feasible(&plan.assignment, 1e-6));
        assert!(plan.objective_value >= 24.0);
    }

    #[test]
    fn expired_deadline_times_out() {
        let err = QuantumSolver::new("qsa", 1)
            .optimize(&problem(), Deadline::after(Duration::ZERO), &AnnealStrategy::default())
            .unwrap_err();
        assert!(matches!(err, SolverError::Timeout { .. }));
    }
}
