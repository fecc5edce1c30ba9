use std::collections::BTreeMap;
use std::fmt;

use hso_cbor::Hash;
use serde::{Deserialize, Serialize};

/// Tag for the solver backends the scheduler can race.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolverKind {
    Classical,
    Quantum,
}

impl SolverKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SolverKind::Classical => "classical",
            SolverKind::Quantum => "quantum",
        }
    }
}

impl fmt::Display for SolverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Integer decision variable with inclusive bounds and a linear cost.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Variable {
    pub name: String,
    pub lower: i64,
    pub upper: i64,
    pub cost: f64,
}

impl Variable {
    pub fn new(name: impl Into<String>, lower: i64, upper: i64, cost: f64) -> Self {
        Self {
            name: name.into(),
            lower,
            upper,
            cost,
        }
    }

    /// `(lower, upper)` in ascending order, whichever way round they were given.
    pub fn bounds(&self) -> (i64, i64) {
        (self.lower.min(self.upper), self.lower.max(self.upper))
    }
}

/// Minimization model over bounded integer variables.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Model {
    pub name: String,
    pub variables: Vec<Variable>,
}

impl Model {
    pub fn objective(&self, assignment: &BTreeMap<String, i64>) -> f64 {
        self.variables
            .iter()
            .map(|v| v.cost * assignment.get(&v.name).copied().unwrap_or(v.lower) as f64)
            .sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintSense {
    Le,
    Ge,
    Eq,
}

/// `sum(coefficients[v] * v) <sense> bound`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LinearConstraint {
    pub name: String,
    pub coefficients: BTreeMap<String, f64>,
    pub sense: ConstraintSense,
    pub bound: f64,
}

impl LinearConstraint {
    pub fn lhs(&self, assignment: &BTreeMap<String, i64>) -> f64 {
        self.coefficients
            .iter()
            .map(|(name, coef)| coef * assignment.get(name).copied().unwrap_or(0) as f64)
            .sum()
    }

    /// Amount by which the constraint is violated; zero when satisfied.
    pub fn violation(&self, assignment: &BTreeMap<String, i64>, tolerance: f64) -> f64 {
        let lhs = self.lhs(assignment);
        let gap = match self.sense {
            ConstraintSense::Le => lhs - self.bound,
            ConstraintSense::Ge => self.bound - lhs,
            ConstraintSense::Eq => (lhs - self.bound).abs(),
        };
        if gap > tolerance { gap } else { 0.0 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Constraints {
    pub rows: Vec<LinearConstraint>,
}

impl Constraints {
    pub fn total_violation(&self, assignment: &BTreeMap<String, i64>, tolerance: f64) -> f64 {
        self.rows
            .iter()
            .map(|row| row.violation(assignment, tolerance))
            .sum()
    }

    pub fn is_feasible(&self, assignment: &BTreeMap<String, i64>, tolerance: f64) -> bool {
        self.total_violation(assignment, tolerance) == 0.0
    }
}

/// The solver-neutral problem statement handed to every backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Problem {
    pub model: Model,
    pub constraints: Constraints,
}

impl Problem {
    pub fn new(model: Model, constraints: Constraints) -> Self {
        Self { model, constraints }
    }

    pub fn hash(&self) -> Result<Hash, serde_cbor::Error> {
        Hash::of_normalized(self)
    }
}

/// How much a plan can be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "score")]
pub enum Confidence {
    /// Solver converged before its deadline.
    Complete,
    /// Best intermediate feasible plan when the deadline hit first.
    Partial,
    /// Best-effort solvers report a score in [0, 1].
    Score(f64),
}

impl Confidence {
    pub fn score(&self) -> f64 {
        match self {
            Confidence::Complete => 1.0,
            Confidence::Partial => 0.5,
            Confidence::Score(s) => s.clamp(0.0, 1.0),
        }
    }

    pub fn is_partial(&self) -> bool {
        matches!(self, Confidence::Partial)
    }
}

/// A candidate solution produced by a solver adapter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Plan {
    pub source: SolverKind,
    pub solver_id: String,
    pub objective_value: f64,
    pub confidence: Confidence,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    pub produced_at_ms: u64,
    pub assignment: BTreeMap<String, i64>,
}

impl Plan {
    /// Hash over the solution content only; timestamps do not participate.
    pub fn content_hash(&self) -> Result<Hash, serde_cbor::Error> {
        #[derive(Serialize)]
        struct PlanContent<'a> {
            source: SolverKind,
            solver_id: &'a str,
            objective_value: f64,
            seed: Option<u64>,
            assignment: &'a BTreeMap<String, i64>,
        }
        Hash::of_normalized(&PlanContent {
            source: self.source,
            solver_id: &self.solver_id,
            objective_value: self.objective_value,
            seed: self.seed,
            assignment: &self.assignment,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assignment(pairs: &[(&str, i64)]) -> BTreeMap<String, i64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn constraint_violation_by_sense() {
        let row = LinearConstraint {
            name: "cap".into(),
            coefficients: [("a".to_string(), 1.0), ("b".to_string(), 2.0)].into(),
            sense: ConstraintSense::Le,
            bound: 4.0,
        };
        assert_eq!(row.violation(&assignment(&[("a", 2), ("b", 1)]), 1e-9), 0.0);
        assert_eq!(row.violation(&assignment(&[("a", 2), ("b", 2)]), 1e-9), 2.0);

        let ge = LinearConstraint {
            sense: ConstraintSense::Ge,
            ..row.clone()
        };
        assert_eq!(ge.violation(&assignment(&[("a", 0), ("b", 1)]), 1e-9), 2.0);
    }

    #[test]
    fn plan_content_hash_ignores_timestamp() {
        let plan = Plan {
            source: SolverKind::Classical,
            solver_id: "csa".into(),
            objective_value: 3.5,
            confidence: Confidence::Complete,
            seed: None,
            produced_at_ms: 1,
            assignment: assignment(&[("x", 1)]),
        };
        let later = Plan {
            produced_at_ms: 99,
            ..plan.clone()
        };
        assert_eq!(plan.content_hash().unwrap(), later.content_hash().unwrap());
    }

    #[test]
    fn confidence_scores() {
        assert_eq!(Confidence::Complete.score(), 1.0);
        assert!(Confidence::Partial.is_partial());
        assert_eq!(Confidence::Score(1.7).score(), 1.0);
    }
}
