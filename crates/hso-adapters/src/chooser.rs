use hso_contracts::Plan;
use tracing::debug;

/// Pick the plan with the lower objective.
///
/// A quantum plan scoring below `min_confidence` never wins. On equal objectives the
/// classical plan is kept since its result is reproducible.
pub fn choose_better(
    classical: Option<Plan>,
    quantum: Option<Plan>,
    min_confidence: f64,
) -> Option<Plan> {
    let quantum = quantum.filter(|plan| {
        let trusted = plan.confidence.score() >= min_confidence;
        if !trusted {
            debug!(
                solver = %plan.solver_id,
                confidence = plan.confidence.score(),
                min_confidence,
                "discarding low-confidence plan"
            );
        }
        trusted
    });
    match (classical, quantum) {
        (Some(c), Some(q)) => {
            if q.objective_value < c.objective_value {
                Some(q)
            } else {
                Some(c)
            }
        }
        (Some(c), None) => Some(c),
        (None, Some(q)) => Some(q),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hso_contracts::{Confidence, SolverKind};

    fn plan(source: SolverKind, objective_value: f64, confidence: Confidence) -> Plan {
        Plan {
            source,
            solver_id: source.as_str().into(),
            objective_value,
            confidence,
            seed: None,
            produced_at_ms: 0,
            assignment: Default::default(),
        }
    }

    #[test]
    fn lower_objective_wins() {
        let c = plan(SolverKind::Classical, 24.0, Confidence::Complete);
        let q = plan(SolverKind::Quantum, 22.0, Confidence::Score(0.9));
        let chosen = choose_better(Some(c), Some(q), 0.5).unwrap();
        assert_eq!(chosen.source, SolverKind::Quantum);
    }

    #[test]
    fn low_confidence_quantum_is_discarded() {
        let c = plan(SolverKind::Classical, 24.0, Confidence::Complete);
        let q = plan(SolverKind::Quantum, 1.0, Confidence::Score(0.2));
        let chosen = choose_better(Some(c), Some(q.clone()), 0.5).unwrap();
        assert_eq!(chosen.source, SolverKind::Classical);
        assert!(choose_better(None, Some(q), 0.5).is_none());
    }

    #[test]
    fn ties_keep_classical() {
        let c = plan(SolverKind::Classical, 24.0, Confidence::Partial);
        let q = plan(SolverKind::Quantum, 24.0, Confidence::Score(1.0));
        let chosen = choose_better(Some(c), Some(q), 0.0).unwrap();
        assert_eq!(chosen.source, SolverKind::Classical);
    }

    #[test]
    fn either_alone_or_neither() {
        let q = plan(SolverKind::Quantum, 5.0, Confidence::Score(0.8));
        assert_eq!(
            choose_better(None, Some(q), 0.5).map(|p| p.source),
            Some(SolverKind::Quantum)
        );
        assert!(choose_better(None, None, 0.5).is_none());
    }
}
