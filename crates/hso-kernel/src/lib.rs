//! Provenance kernel of the orchestration loop: state commit, lineage and evidence
//! queries, external anchoring, Ed25519 signing and the cycle journal.

pub mod anchor;
pub mod commit;
pub mod journal;
pub mod retry;
pub mod signing;

pub use anchor::{AnchorError, AnchorLedger, AnchorService};
pub use commit::{CommitError, RecordVerification, StateCommitter};
pub use journal::{
    CycleEndedRecord, CycleStartedRecord, Journal, JournalError, JournalKind, JournalRecord,
    JournalSeq, SharedJournal, StageCompletedRecord, fs::FsJournal, mem::MemJournal,
};
pub use retry::{RetryPolicy, compute_backoff_delay, retry_async};
pub use signing::{Ed25519Signer, Ed25519Verifier, SignatureVerifier, StateSigner};
