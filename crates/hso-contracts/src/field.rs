use hso_cbor::Hash;
use serde::{Deserialize, Serialize};

/// Spatial extent a forecast covers: an identifier plus the number of grid cells.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Area {
    pub id: String,
    pub cells: u32,
}

impl Area {
    pub fn new(id: impl Into<String>, cells: u32) -> Self {
        Self {
            id: id.into(),
            cells,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Nowcast,
    /// Reconstructed past field; diagnostic and backtesting use only.
    Retrodict,
}

/// Closed time window in wall-clock milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PastWindow {
    pub start_ms: u64,
    pub end_ms: u64,
}

/// Time-bounded predictive field. `grid[t][c]` is the value for step `t`, cell `c`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Field {
    pub kind: FieldKind,
    pub area: Area,
    pub horizon_s: u64,
    pub step_s: u64,
    pub grid: Vec<Vec<f64>>,
    pub generated_at_ms: u64,
    pub staleness_bound_ms: u64,
}

impl Field {
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.generated_at_ms)
    }

    /// A field older than its staleness bound must not be consumed as fresh input.
    pub fn is_stale(&self, now_ms: u64) -> bool {
        self.age_ms(now_ms) > self.staleness_bound_ms
    }

    pub fn steps(&self) -> usize {
        self.grid.len()
    }

    /// Mean of every cell at step `t`, if the step exists and is non-empty.
    pub fn step_mean(&self, t: usize) -> Option<f64> {
        let row = self.grid.get(t)?;
        if row.is_empty() {
            return None;
        }
        Some(row.iter().sum::<f64>() / row.len() as f64)
    }

    pub fn hash(&self) -> Result<Hash, serde_cbor::Error> {
        Hash::of_normalized(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(generated_at_ms: u64, bound: u64) -> Field {
        Field {
            kind: FieldKind::Nowcast,
            area: Area::new("east", 2),
            horizon_s: 60,
            step_s: 30,
            grid: vec![vec![1.0, 3.0], vec![2.0, 4.0]],
            generated_at_ms,
            staleness_bound_ms: bound,
        }
    }

    #[test]
    fn staleness_is_strictly_past_bound() {
        let f = field(1_000, 500);
        assert!(!f.is_stale(1_500));
        assert!(f.is_stale(1_501));
        // Clock skew (generated in the future) is treated as fresh.
        assert!(!f.is_stale(900));
    }

    #[test]
    fn step_means() {
        let f = field(0, 1);
        assert_eq!(f.step_mean(0), Some(2.0));
        assert_eq!(f.step_mean(1), Some(3.0));
        assert_eq!(f.step_mean(2), None);
    }
}
