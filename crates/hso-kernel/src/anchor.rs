//! Fire-and-forget anchoring of committed record hashes to an external ledger.
//!
//! Requests are idempotent by canonical hash. The first request spawns a detached
//! submission task that retries with exponential backoff. Later requests for a pending
//! or anchored hash return a resubmission ticket without touching the ledger; a request
//! for a hash whose retries were exhausted starts a new submission under the same ticket.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hso_cbor::Hash;
use hso_contracts::{AnchorRef, AnchorStatus, AnchorTicket, StateRecord, now_wallclock_ms};
use hso_store::{DynStore, StoreError};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::journal::{AnchorUpdatedRecord, JournalRecord, SharedJournal};
use crate::retry::{RetryPolicy, retry_async};

/// External tamper-evidence ledger. Returns a transaction reference for `hash`.
#[async_trait]
pub trait AnchorLedger: Send + Sync {
    fn name(&self) -> &str;
    async fn submit(&self, hash: Hash) -> anyhow::Result<String>;
}

#[derive(Debug, Error)]
pub enum AnchorError {
    #[error(
        "refusing to anchor record with mismatched hash: stored {expected}, recomputed {actual}"
    )]
    HashMismatch { expected: Hash, actual: Hash },
    #[error("record hash could not be recomputed: {0}")]
    Encoding(#[from] serde_cbor::Error),
    #[error("anchor requests need a running tokio runtime")]
    NoRuntime,
    #[error("anchor state lock poisoned")]
    Poisoned,
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
struct AnchorEntry {
    ticket_id: u64,
    status: AnchorStatus,
}

type AnchorTable = Arc<Mutex<HashMap<Hash, AnchorEntry>>>;

pub struct AnchorService {
    ledger: Arc<dyn AnchorLedger>,
    store: DynStore,
    journal: Option<SharedJournal>,
    retry: RetryPolicy,
    entries: AnchorTable,
    next_ticket: AtomicU64,
}

impl std::fmt::Debug for AnchorService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnchorService")
            .field("ledger", &self.ledger.name())
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl AnchorService {
    pub fn new(ledger: Arc<dyn AnchorLedger>, store: DynStore, retry: RetryPolicy) -> Self {
        Self {
            ledger,
            store,
            journal: None,
            retry,
            entries: Arc::new(Mutex::new(HashMap::new())),
            next_ticket: AtomicU64::new(1),
        }
    }

    pub fn with_journal(mut self, journal: SharedJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Queue `record` for anchoring and return immediately.
    pub fn request_anchor(&self, record: &StateRecord) -> Result<AnchorTicket, AnchorError> {
        let actual = record.recompute_hash()?;
        if actual != record.hash {
            return Err(AnchorError::HashMismatch {
                expected: record.hash,
                actual,
            });
        }
        let hash = record.hash;

        let (ticket_id, resubmission) = {
            let mut entries = self.entries.lock().map_err(|_| AnchorError::Poisoned)?;
            let previous = match entries.get(&hash) {
                Some(entry) if !matches!(entry.status, AnchorStatus::Failed { .. }) => {
                    debug!(
                        hash = %hash.short(),
                        ticket = entry.ticket_id,
                        "anchor already requested"
                    );
                    return Ok(AnchorTicket {
                        hash,
                        ticket_id: entry.ticket_id,
                        resubmission: true,
                    });
                }
                Some(entry) => Some(entry.ticket_id),
                None => None,
            };
            let ticket_id = match previous {
                Some(ticket_id) => ticket_id,
                None => self.next_ticket.fetch_add(1, Ordering::SeqCst),
            };
            if let Some(anchor) = self.store.get_anchor(hash)? {
                // Anchored in an earlier process lifetime.
                entries.insert(
                    hash,
                    AnchorEntry {
                        ticket_id,
                        status: AnchorStatus::Anchored { anchor },
                    },
                );
                return Ok(AnchorTicket {
                    hash,
                    ticket_id,
                    resubmission: true,
                });
            }
            let runtime =
                tokio::runtime::Handle::try_current().map_err(|_| AnchorError::NoRuntime)?;
            entries.insert(
                hash,
                AnchorEntry {
                    ticket_id,
                    status: AnchorStatus::Pending { attempts: 0 },
                },
            );
            runtime.spawn(submit_with_retry(
                hash,
                self.ledger.clone(),
                self.store.clone(),
                self.journal.clone(),
                self.retry.clone(),
                self.entries.clone(),
            ));
            (ticket_id, previous.is_some())
        };

        info!(
            hash = %hash.short(),
            ticket = ticket_id,
            ledger = self.ledger.name(),
            resubmission,
            "anchor requested"
        );
        Ok(AnchorTicket {
            hash,
            ticket_id,
            resubmission,
        })
    }

    pub fn anchor_status(&self, hash: Hash) -> Result<AnchorStatus, AnchorError> {
        {
            let entries = self.entries.lock().map_err(|_| AnchorError::Poisoned)?;
            if let Some(entry) = entries.get(&hash) {
                return Ok(entry.status.clone());
            }
        }
        Ok(match self.store.get_anchor(hash)? {
            Some(anchor) => AnchorStatus::Anchored { anchor },
            None => AnchorStatus::NotRequested,
        })
    }

    /// Poll until the anchor for `hash` leaves `Pending` or `within` elapses.
    pub async fn settled(
        &self,
        hash: Hash,
        within: Duration,
    ) -> Result<AnchorStatus, AnchorError> {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            let status = self.anchor_status(hash)?;
            if !matches!(status, AnchorStatus::Pending { .. })
                || tokio::time::Instant::now() >= deadline
            {
                return Ok(status);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

fn set_status(entries: &AnchorTable, hash: Hash, status: AnchorStatus) {
    if let Ok(mut entries) = entries.lock() {
        if let Some(entry) = entries.get_mut(&hash) {
            entry.status = status;
        }
    }
}

async fn submit_with_retry(
    hash: Hash,
    ledger: Arc<dyn AnchorLedger>,
    store: DynStore,
    journal: Option<SharedJournal>,
    retry: RetryPolicy,
    entries: AnchorTable,
) {
    let mut attempts = 0u32;
    let result = retry_async(
        &retry,
        |_: &anyhow::Error| true,
        |err, attempt, delay| {
            attempts = attempt + 1;
            warn!(
                hash = %hash.short(),
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "anchor submission failed; retrying"
            );
            set_status(&entries, hash, AnchorStatus::Pending { attempts });
        },
        || ledger.submit(hash),
    )
    .await;

    let status = match result {
        Ok(tx_ref) => {
            let anchor = AnchorRef {
                ledger: ledger.name().to_string(),
                tx_ref,
                anchored_at_ms: now_wallclock_ms(),
            };
            match store.put_anchor(hash, &anchor) {
                Ok(()) => {
                    info!(hash = %hash.short(), tx = %anchor.tx_ref, "record anchored");
                    AnchorStatus::Anchored { anchor }
                }
                Err(err) => AnchorStatus::Failed {
                    attempts: attempts + 1,
                    reason: format!("anchor stored on ledger but not locally: {err}"),
                },
            }
        }
        Err(err) => {
            warn!(hash = %hash.short(), error = %err, "anchor submission abandoned");
            AnchorStatus::Failed {
                attempts: attempts + 1,
                reason: err.to_string(),
            }
        }
    };

    if let Some(journal) = journal {
        let record = JournalRecord::AnchorUpdated(AnchorUpdatedRecord {
            hash,
            status: status.clone(),
        });
        if let Err(err) = journal.append(&record) {
            warn!(hash = %hash.short(), error = %err, "failed to journal anchor update");
        }
    }
    set_status(&entries, hash, status);
}

#[cfg(any(test, feature = "test-fixtures"))]
pub mod mock {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Ledger that records every submission in memory.
    #[derive(Debug, Default)]
    pub struct MemAnchorLedger {
        submissions: Mutex<Vec<Hash>>,
        delay: Duration,
    }

    impl MemAnchorLedger {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_delay(delay: Duration) -> Self {
            Self {
                submissions: Mutex::new(Vec::new()),
                delay,
            }
        }

        pub fn submissions(&self) -> Vec<Hash> {
            self.submissions
                .lock()
                .map(|guard| guard.clone())
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl AnchorLedger for MemAnchorLedger {
        fn name(&self) -> &str {
            "mem"
        }

        async fn submit(&self, hash: Hash) -> anyhow::Result<String> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let mut guard = self
                .submissions
                .lock()
                .map_err(|_| anyhow::anyhow!("ledger lock poisoned"))?;
            guard.push(hash);
            Ok(format!("mem-tx-{}", guard.len()))
        }
    }

    /// Ledger that rejects the first `failures` submissions.
    #[derive(Debug)]
    pub struct FlakyAnchorLedger {
        failures: usize,
        calls: AtomicUsize,
    }

    impl FlakyAnchorLedger {
        pub fn new(failures: usize) -> Self {
            Self {
                failures,
                calls: AtomicUsize::new(0),
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AnchorLedger for FlakyAnchorLedger {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn submit(&self, hash: Hash) -> anyhow::Result<String> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                anyhow::bail!("ledger unreachable (call {call})");
            }
            Ok(format!("flaky-tx-{}", hash.short()))
        }
    }
}
