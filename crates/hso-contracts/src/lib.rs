//! Shared envelope, plan, allocation, field, and state-record types plus the stage error
//! taxonomy used across the orchestration loop.

pub mod abort;
pub mod allocation;
pub mod cycle;
pub mod deadline;
pub mod envelope;
pub mod error;
pub mod field;
pub mod plan;
pub mod record;
mod time;

pub use abort::{AbortController, AbortSignal};
pub use allocation::{
    Allocation, AllocationStatus, Asset, AssetId, DEFAULT_QUORUM_TOLERANCE, ImpactClass,
    PolicyProfile, QuorumRounding, QuorumRule, QuorumSignature, TieBreak,
};
pub use cycle::{Cycle, CycleOutcome, StageKind, StageReport, StageStatus};
pub use deadline::Deadline;
pub use envelope::{Envelope, EnvelopeBuilder, Provenance, Quality, Security, Tfa};
pub use error::StageError;
pub use field::{Area, Field, FieldKind, PastWindow};
pub use plan::{
    Confidence, ConstraintSense, Constraints, LinearConstraint, Model, Plan, Problem, SolverKind,
    Variable,
};
pub use record::{
    AnchorRef, AnchorStatus, AnchorTicket, Evidence, EvidenceBundle, LineageKind, LineageLink,
    RecordSignature, StateId, StateRecord,
};
pub use time::now_wallclock_ms;
