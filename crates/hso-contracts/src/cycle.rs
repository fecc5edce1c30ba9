use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::StageError;
use crate::plan::SolverKind;
use crate::record::StateId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Solve,
    Federate,
    Forecast,
    Commit,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Solve => "solve",
            StageKind::Federate => "federate",
            StageKind::Forecast => "forecast",
            StageKind::Commit => "commit",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Ok,
    /// Stage produced output from a fallback (classical plan, prior field).
    Fallback,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageReport {
    pub stage: StageKind,
    pub status: StageStatus,
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<StageError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleOutcome {
    Pending,
    Degraded,
    Committed,
    Failed,
}

impl CycleOutcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CycleOutcome::Pending)
    }
}

/// One scheduling period for one domain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Cycle {
    pub cycle_id: u64,
    pub domain: String,
    pub trace_id: String,
    pub started_at_ms: u64,
    pub deadline_ms: u64,
    pub stages: Vec<StageReport>,
    pub outcome: CycleOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_source: Option<SolverKind>,
    #[serde(default)]
    pub field_stale: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<StateId>,
    #[serde(default)]
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<String>,
}

impl Cycle {
    pub fn new(
        domain: impl Into<String>,
        cycle_id: u64,
        trace_id: String,
        started_at_ms: u64,
        deadline_ms: u64,
    ) -> Self {
        Self {
            cycle_id,
            domain: domain.into(),
            trace_id,
            started_at_ms,
            deadline_ms,
            stages: Vec::new(),
            outcome: CycleOutcome::Pending,
            plan_source: None,
            field_stale: false,
            record_id: None,
            elapsed_ms: 0,
            diagnostics: Vec::new(),
        }
    }

    pub fn stage(&self, kind: StageKind) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.stage == kind)
    }

    pub fn errors(&self) -> impl Iterator<Item = &StageError> {
        self.stages.iter().flat_map(|s| s.errors.iter())
    }
}
