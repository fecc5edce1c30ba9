pub mod fs;
pub mod mem;

use std::sync::{Arc, Mutex};

use hso_cbor::{Hash, to_canonical_cbor};
use hso_contracts::{AnchorStatus, CycleOutcome, StageReport, StateId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Monotonic cursor assigned to every persisted journal entry.
pub type JournalSeq = u64;

/// High-level classification of a journal entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalKind {
    CycleStarted,
    StageCompleted,
    CycleEnded,
    StateCommitted,
    AnchorUpdated,
}

/// Typed payloads for each [`JournalKind`], serialized into the entry payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "record_kind", rename_all = "snake_case")]
pub enum JournalRecord {
    CycleStarted(CycleStartedRecord),
    StageCompleted(StageCompletedRecord),
    CycleEnded(CycleEndedRecord),
    StateCommitted(StateCommittedRecord),
    AnchorUpdated(AnchorUpdatedRecord),
}

impl JournalRecord {
    pub fn kind(&self) -> JournalKind {
        match self {
            JournalRecord::CycleStarted(_) => JournalKind::CycleStarted,
            JournalRecord::StageCompleted(_) => JournalKind::StageCompleted,
            JournalRecord::CycleEnded(_) => JournalKind::CycleEnded,
            JournalRecord::StateCommitted(_) => JournalKind::StateCommitted,
            JournalRecord::AnchorUpdated(_) => JournalKind::AnchorUpdated,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CycleStartedRecord {
    pub domain: String,
    pub cycle_id: u64,
    pub trace_id: String,
    pub started_at_ms: u64,
    pub deadline_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageCompletedRecord {
    pub domain: String,
    pub cycle_id: u64,
    pub report: StageReport,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CycleEndedRecord {
    pub domain: String,
    pub cycle_id: u64,
    pub outcome: CycleOutcome,
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<StateId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateCommittedRecord {
    pub state_id: StateId,
    pub hash: Hash,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<StateId>,
    pub signatures: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnchorUpdatedRecord {
    pub hash: Hash,
    pub status: AnchorStatus,
}

/// Borrowed entry used when appending to the journal.
#[derive(Debug, Clone, Copy)]
pub struct JournalEntry<'a> {
    pub kind: JournalKind,
    pub payload: &'a [u8],
}

impl<'a> JournalEntry<'a> {
    pub fn new(kind: JournalKind, payload: &'a [u8]) -> Self {
        Self { kind, payload }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OwnedJournalEntry {
    pub seq: JournalSeq,
    pub kind: JournalKind,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

impl OwnedJournalEntry {
    pub fn decode(&self) -> Result<JournalRecord, JournalError> {
        Ok(serde_cbor::from_slice(&self.payload)?)
    }
}

#[derive(Serialize)]
struct DiskRecord<'a> {
    seq: JournalSeq,
    kind: JournalKind,
    #[serde(with = "serde_bytes")]
    payload: &'a [u8],
}

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("journal encoding error: {0}")]
    Cbor(#[from] serde_cbor::Error),
    #[error("journal corrupt: {0}")]
    Corrupt(String),
    #[error("journal lock poisoned")]
    Poisoned,
}

/// Append-only cycle log.
pub trait Journal: Send {
    fn append(&mut self, entry: JournalEntry<'_>) -> Result<JournalSeq, JournalError>;
    fn load_from(&self, from: JournalSeq) -> Result<Vec<OwnedJournalEntry>, JournalError>;
    fn next_seq(&self) -> JournalSeq;
}

/// Cloneable handle over a boxed journal, shared by the committer, the anchor service
/// and the scheduler.
#[derive(Clone)]
pub struct SharedJournal {
    inner: Arc<Mutex<Box<dyn Journal>>>,
}

impl std::fmt::Debug for SharedJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedJournal").finish_non_exhaustive()
    }
}

impl SharedJournal {
    pub fn new(journal: impl Journal + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(journal))),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(mem::MemJournal::new())
    }

    pub fn append(&self, record: &JournalRecord) -> Result<JournalSeq, JournalError> {
        let payload = to_canonical_cbor(record)?;
        let mut guard = self.inner.lock().map_err(|_| JournalError::Poisoned)?;
        guard.append(JournalEntry::new(record.kind(), &payload))
    }

    /// Decode every record from `from` onwards.
    pub fn records_from(&self, from: JournalSeq) -> Result<Vec<JournalRecord>, JournalError> {
        let entries = {
            let guard = self.inner.lock().map_err(|_| JournalError::Poisoned)?;
            guard.load_from(from)?
        };
        entries.iter().map(OwnedJournalEntry::decode).collect()
    }

    pub fn next_seq(&self) -> Result<JournalSeq, JournalError> {
        let guard = self.inner.lock().map_err(|_| JournalError::Poisoned)?;
        Ok(guard.next_seq())
    }
}
