//! Write-once storage for committed state records plus filesystem and in-memory backends.
//!
//! Records are stored as canonical CBOR keyed by their canonical hash and indexed by
//! state id. Every read recomputes the record hash; a mismatch surfaces as
//! [`StoreError::HashMismatch`]. Each domain has a head pointer to its most recent
//! record, and heads only ever advance to a larger `cycle_id`.

mod fs_store;
mod mem_store;

pub use fs_store::FsStore;
pub use mem_store::MemStore;

use hso_cbor::Hash;
use hso_contracts::{AnchorRef, StateId, StateRecord};
use std::{io, path::PathBuf, sync::Arc};

pub type StoreResult<T> = Result<T, StoreError>;
pub type DynStore = Arc<dyn StateStore>;

/// Trait implemented by all state record stores.
pub trait StateStore: Send + Sync {
    /// Persist a record and advance its domain head. Re-putting an identical record is a
    /// no-op; a different record under an existing id is rejected.
    fn put_record(&self, record: &StateRecord) -> StoreResult<()>;

    fn get_record(&self, id: &StateId) -> StoreResult<Option<StateRecord>>;

    fn get_by_hash(&self, hash: Hash) -> StoreResult<Option<StateRecord>>;

    /// Most recent committed record for `domain`.
    fn latest(&self, domain: &str) -> StoreResult<Option<StateRecord>>;

    /// Attach an external anchor to a stored record. Anchors are kept beside the record
    /// bytes, which never change.
    fn put_anchor(&self, hash: Hash, anchor: &AnchorRef) -> StoreResult<()>;

    fn get_anchor(&self, hash: Hash) -> StoreResult<Option<AnchorRef>>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("CBOR serialization error: {0}")]
    Cbor(#[from] serde_cbor::Error),
    #[error("hash mismatch for record '{id}': stored {expected}, recomputed {actual}")]
    HashMismatch {
        id: StateId,
        expected: Hash,
        actual: Hash,
    },
    #[error("record '{id}' already exists with a different hash")]
    Conflict { id: StateId },
    #[error("record '{id}' is out of order: domain head is at cycle {head_cycle}")]
    OutOfOrder { id: StateId, head_cycle: u64 },
    #[error("anchor references unknown record {0}")]
    UnknownRecord(Hash),
    #[error("invalid hash string '{value}': {source}")]
    InvalidHashString {
        value: String,
        #[source]
        source: hso_cbor::HashParseError,
    },
    #[error("store lock poisoned")]
    Poisoned,
}

pub(crate) fn io_error(path: impl Into<PathBuf>, err: io::Error) -> StoreError {
    StoreError::Io {
        path: path.into(),
        source: err,
    }
}

/// Decode record bytes and check the stored hash against a fresh recomputation.
pub(crate) fn decode_verified(bytes: &[u8]) -> StoreResult<StateRecord> {
    let record: StateRecord = serde_cbor::from_slice(bytes)?;
    let actual = record.recompute_hash()?;
    if actual != record.hash {
        return Err(StoreError::HashMismatch {
            id: record.id.clone(),
            expected: record.hash,
            actual,
        });
    }
    Ok(record)
}
