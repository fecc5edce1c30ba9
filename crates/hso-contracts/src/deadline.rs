use std::time::{Duration, Instant};

/// Absolute deadline with the budget it was created from.
///
/// Stage budgets are carved out of the cycle deadline with [`Deadline::sub_budget`]; a
/// sub-budget never extends past its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
            budget,
        }
    }

    pub fn after_ms(budget_ms: u64) -> Self {
        Self::after(Duration::from_millis(budget_ms))
    }

    pub fn instant(&self) -> Instant {
        self.at
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn budget_ms(&self) -> u64 {
        self.budget.as_millis() as u64
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn remaining_ms(&self) -> u64 {
        self.remaining().as_millis() as u64
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.at
    }

    /// A child deadline of at most `fraction` of the original budget, clamped to what
    /// is left of `self`.
    pub fn sub_budget(&self, fraction: f64) -> Deadline {
        let fraction = fraction.clamp(0.0, 1.0);
        let share = self.budget.mul_f64(fraction);
        self.capped(share)
    }

    /// A child deadline lasting `budget`, clamped to what is left of `self`.
    pub fn capped(&self, budget: Duration) -> Deadline {
        let now = Instant::now();
        let budget = budget.min(self.at.saturating_duration_since(now));
        Deadline {
            at: now + budget,
            budget,
        }
    }

    /// A child deadline that leaves `reserve` untouched at the end of `self`.
    pub fn reserving(&self, reserve: Duration) -> Deadline {
        let now = Instant::now();
        let budget = self.at.saturating_duration_since(now).saturating_sub(reserve);
        Deadline {
            at: now + budget,
            budget,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_budget_never_exceeds_parent() {
        let parent = Deadline::after_ms(100);
        let child = parent.sub_budget(8.0);
        assert!(child.instant() <= parent.instant());
        let half = parent.sub_budget(0.5);
        assert!(half.budget_ms() <= 50);
    }

    #[test]
    fn capped_clamps_to_remaining() {
        let parent = Deadline::after_ms(300);
        let child = parent.capped(Duration::from_millis(800));
        assert!(child.budget() <= Duration::from_millis(300));
        assert!(child.instant() <= parent.instant());
    }

    #[test]
    fn reserving_holds_back_tail() {
        let parent = Deadline::after_ms(200);
        let child = parent.reserving(Duration::from_millis(50));
        assert!(child.budget() <= Duration::from_millis(150));
        let none_left = parent.reserving(Duration::from_secs(5));
        assert_eq!(none_left.budget(), Duration::ZERO);
        assert!(none_left.is_expired());
    }
}
