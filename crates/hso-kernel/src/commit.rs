use std::collections::HashSet;
use std::sync::Arc;

use hso_cbor::{Hash, to_canonical_cbor};
use hso_contracts::{
    AnchorStatus, Evidence, EvidenceBundle, LineageKind, LineageLink, RecordSignature, StateId,
    StateRecord, now_wallclock_ms,
};
use hso_store::{DynStore, StoreError};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::anchor::{AnchorError, AnchorService};
use crate::journal::{JournalRecord, SharedJournal, StateCommittedRecord};
use crate::signing::{SignatureVerifier, StateSigner};

/// Ancestors beyond this depth are not walked by lineage queries.
pub const MAX_LINEAGE_DEPTH: usize = 1_024;

#[derive(Debug, Error)]
pub enum CommitError {
    #[error("artifact could not be converted for hashing: {0}")]
    Artifact(#[from] serde_json::Error),
    #[error("artifact is empty")]
    EmptyArtifact,
    #[error("canonical encoding failed: {0}")]
    Encoding(#[from] serde_cbor::Error),
    #[error("no signer configured; refusing to commit unsigned state")]
    Unsigned,
    #[error("none of the {0} signatures on the record verified")]
    SignatureInvalid(usize),
    #[error("hash mismatch for '{id}': computed {expected}, recomputed {actual}")]
    HashMismatch {
        id: StateId,
        expected: Hash,
        actual: Hash,
    },
    #[error("state '{0}' not found")]
    NotFound(StateId),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Anchor(#[from] AnchorError),
}

impl CommitError {
    /// Hash mismatches are fatal for the record; nothing was persisted or anchored.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CommitError::HashMismatch { .. } | CommitError::Store(StoreError::HashMismatch { .. })
        )
    }
}

/// Result of re-checking a stored record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordVerification {
    pub id: StateId,
    pub hash: Hash,
    pub total_signatures: usize,
    pub valid_signatures: usize,
}

impl RecordVerification {
    pub fn is_valid(&self) -> bool {
        self.total_signatures > 0 && self.valid_signatures == self.total_signatures
    }
}

/// Hashes, signs, verifies and persists cycle artifacts.
pub struct StateCommitter {
    store: DynStore,
    signers: Vec<Arc<dyn StateSigner>>,
    verifier: Arc<dyn SignatureVerifier>,
    journal: Option<SharedJournal>,
    anchors: Option<Arc<AnchorService>>,
}

impl std::fmt::Debug for StateCommitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateCommitter")
            .field(
                "signers",
                &self.signers.iter().map(|s| s.signer_id()).collect::<Vec<_>>(),
            )
            .field("anchoring", &self.anchors.is_some())
            .finish_non_exhaustive()
    }
}

impl StateCommitter {
    pub fn new(
        store: DynStore,
        signer: Arc<dyn StateSigner>,
        verifier: Arc<dyn SignatureVerifier>,
    ) -> Self {
        Self {
            store,
            signers: vec![signer],
            verifier,
            journal: None,
            anchors: None,
        }
    }

    pub fn with_signer(mut self, signer: Arc<dyn StateSigner>) -> Self {
        self.signers.push(signer);
        self
    }

    pub fn with_journal(mut self, journal: SharedJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn with_anchors(mut self, anchors: Arc<AnchorService>) -> Self {
        self.anchors = Some(anchors);
        self
    }

    pub fn store(&self) -> &DynStore {
        &self.store
    }

    pub fn anchors(&self) -> Option<&Arc<AnchorService>> {
        self.anchors.as_ref()
    }

    /// Hash, sign, verify and persist `artifact` as the state of `domain` at `cycle_id`.
    ///
    /// A parent link to the domain's current head is added when `lineage` has none.
    /// Nothing is persisted unless at least one signature verifies and the hash
    /// recomputed from the canonical bytes matches.
    pub fn commit_state<A: Serialize>(
        &self,
        domain: &str,
        cycle_id: u64,
        artifact: &A,
        mut lineage: Vec<LineageLink>,
        evidence: Vec<Evidence>,
    ) -> Result<StateRecord, CommitError> {
        let artifact = serde_json::to_value(artifact)?;
        if artifact.is_null() {
            return Err(CommitError::EmptyArtifact);
        }
        if self.signers.is_empty() {
            return Err(CommitError::Unsigned);
        }
        if !lineage.iter().any(|link| link.kind == LineageKind::Parent) {
            if let Some(head) = self.store.latest(domain)? {
                lineage.push(LineageLink::parent(head.id.clone(), head.hash));
            }
        }

        let id = StateId::new(domain, cycle_id);
        let hash = StateRecord::compute_hash(&artifact, &lineage)?;
        let signatures: Vec<RecordSignature> = self
            .signers
            .iter()
            .map(|signer| signer.sign_record(hash.as_bytes()))
            .collect();
        let valid = signatures
            .iter()
            .filter(|sig| self.verifier.verify_record(hash.as_bytes(), sig))
            .count();
        if valid == 0 {
            return Err(CommitError::SignatureInvalid(signatures.len()));
        }

        let record = StateRecord {
            id: id.clone(),
            domain: domain.to_string(),
            cycle_id,
            hash,
            artifact,
            signatures,
            lineage,
            evidence,
            utcs_anchor: None,
            committed_at_ms: now_wallclock_ms(),
        };

        // Recompute from the bytes that will be stored, not from the in-memory value.
        let bytes = to_canonical_cbor(&record)?;
        let decoded: StateRecord = serde_cbor::from_slice(&bytes)?;
        let actual = decoded.recompute_hash()?;
        if actual != hash {
            warn!(state = %id, expected = %hash, actual = %actual, "hash mismatch; commit aborted");
            return Err(CommitError::HashMismatch {
                id,
                expected: hash,
                actual,
            });
        }

        self.store.put_record(&record)?;
        if let Some(journal) = &self.journal {
            let entry = JournalRecord::StateCommitted(StateCommittedRecord {
                state_id: record.id.clone(),
                hash: record.hash,
                parent: record.parent().cloned(),
                signatures: record.signatures.len(),
            });
            if let Err(err) = journal.append(&entry) {
                warn!(state = %record.id, error = %err, "failed to journal commit");
            }
        }
        info!(
            state = %record.id,
            hash = %record.hash.short(),
            signatures = record.signatures.len(),
            "state committed"
        );
        Ok(record)
    }

    pub fn get(&self, id: &StateId) -> Result<StateRecord, CommitError> {
        self.store
            .get_record(id)?
            .ok_or_else(|| CommitError::NotFound(id.clone()))
    }

    /// The record for `id` followed by its ancestors, newest first.
    pub fn query_lineage(&self, id: &StateId) -> Result<Vec<StateRecord>, CommitError> {
        let mut chain = vec![self.get(id)?];
        let mut seen: HashSet<StateId> = HashSet::from([id.clone()]);
        while chain.len() < MAX_LINEAGE_DEPTH {
            let Some(parent) = chain.last().and_then(|r| r.parent()).cloned() else {
                break;
            };
            if !seen.insert(parent.clone()) {
                break;
            }
            match self.store.get_record(&parent)? {
                Some(record) => chain.push(record),
                None => {
                    debug!(state = %id, missing = %parent, "lineage ends at missing parent");
                    break;
                }
            }
        }
        Ok(chain)
    }

    /// Recompute the hash and check every signature of a stored record.
    pub fn verify_record(&self, id: &StateId) -> Result<RecordVerification, CommitError> {
        let record = self.get(id)?;
        let actual = record.recompute_hash()?;
        if actual != record.hash {
            return Err(CommitError::HashMismatch {
                id: id.clone(),
                expected: record.hash,
                actual,
            });
        }
        let valid_signatures = record
            .signatures
            .iter()
            .filter(|sig| self.verifier.verify_record(record.hash.as_bytes(), sig))
            .count();
        Ok(RecordVerification {
            id: record.id,
            hash: record.hash,
            total_signatures: record.signatures.len(),
            valid_signatures,
        })
    }

    pub fn export_evidence(&self, id: &StateId) -> Result<EvidenceBundle, CommitError> {
        let verification = self.verify_record(id)?;
        let mut chain = self.query_lineage(id)?;
        let record = chain.remove(0);
        let anchor = match (&self.anchors, &record.utcs_anchor) {
            (_, Some(anchor)) => AnchorStatus::Anchored {
                anchor: anchor.clone(),
            },
            (Some(service), None) => service.anchor_status(record.hash)?,
            (None, None) => AnchorStatus::NotRequested,
        };
        Ok(EvidenceBundle {
            record,
            lineage: chain,
            hash_verified: true,
            valid_signatures: verification.valid_signatures,
            anchor,
            exported_at_ms: now_wallclock_ms(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::JournalKind;
    use crate::signing::{Ed25519Signer, Ed25519Verifier};
    use hso_store::{MemStore, StateStore};
    use serde_json::json;

    fn committer(store: Arc<MemStore>) -> StateCommitter {
        StateCommitter::new(
            store,
            Arc::new(Ed25519Signer::from_seed("sc", [4u8; 32])),
            Arc::new(Ed25519Verifier::new()),
        )
    }

    fn plan_link(tag: &[u8]) -> Vec<LineageLink> {
        vec![LineageLink::input("plan", Hash::of_bytes(tag))]
    }

    #[test]
    fn identical_inputs_hash_identically() {
        let a = committer(Arc::new(MemStore::new()));
        let b = committer(Arc::new(MemStore::new()));
        let artifact = json!({"plan": {"x": 3, "y": 1}, "objective": 7.0});
        let ra = a.commit_state("d", 1, &artifact, plan_link(b"p"), vec![]).unwrap();
        let rb = b.commit_state("d", 1, &artifact, plan_link(b"p"), vec![]).unwrap();
        assert_eq!(ra.hash, rb.hash);
        assert_eq!(ra.signatures, rb.signatures);
    }

    #[test]
    fn commits_chain_to_domain_head() {
        let store = Arc::new(MemStore::new());
        let journal = SharedJournal::in_memory();
        let sc = committer(store.clone()).with_journal(journal.clone());
        let first = sc.commit_state("d", 1, &json!({"v": 1}), plan_link(b"1"), vec![]).unwrap();
        let second = sc.commit_state("d", 2, &json!({"v": 2}), plan_link(b"2"), vec![]).unwrap();
        let third = sc.commit_state("d", 3, &json!({"v": 3}), plan_link(b"3"), vec![]).unwrap();

        assert_eq!(second.parent(), Some(&first.id));
        let lineage = sc.query_lineage(&third.id).unwrap();
        let ids: Vec<_> = lineage.iter().map(|r| r.cycle_id).collect();
        assert_eq!(ids, vec![3, 2, 1]);
        assert_eq!(store.latest("d").unwrap().unwrap().id, third.id);

        let kinds: Vec<_> = journal
            .records_from(0)
            .unwrap()
            .iter()
            .map(JournalRecord::kind)
            .collect();
        assert_eq!(kinds, vec![JournalKind::StateCommitted; 3]);
    }

    #[test]
    fn rejects_signatures_that_do_not_verify() {
        let store = Arc::new(MemStore::new());
        let signer = Ed25519Signer::from_seed("sc", [4u8; 32]);
        let verifier = Ed25519Verifier::strict().pin("someone-else", signer.public_key());
        let sc = StateCommitter::new(store.clone(), Arc::new(signer), Arc::new(verifier));
        let err = sc
            .commit_state("d", 1, &json!({"v": 1}), plan_link(b"1"), vec![])
            .unwrap_err();
        assert!(matches!(err, CommitError::SignatureInvalid(1)));
        assert!(store.latest("d").unwrap().is_none());
    }

    #[test]
    fn rejects_empty_artifact() {
        let sc = committer(Arc::new(MemStore::new()));
        let err = sc
            .commit_state("d", 1, &serde_json::Value::Null, vec![], vec![])
            .unwrap_err();
        assert!(matches!(err, CommitError::EmptyArtifact));
    }

    #[test]
    fn verify_and_export_evidence() {
        let store = Arc::new(MemStore::new());
        let sc = committer(store.clone());
        let first = sc.commit_state("d", 1, &json!({"v": 1}), plan_link(b"1"), vec![]).unwrap();
        let second = sc
            .commit_state(
                "d",
                2,
                &json!({"v": 2}),
                plan_link(b"2"),
                vec![Evidence {
                    kind: "allocation".into(),
                    hash: Hash::of_bytes(b"alloc"),
                    detail: json!({"signers": 2}),
                }],
            )
            .unwrap();

        let check = sc.verify_record(&second.id).unwrap();
        assert!(check.is_valid());

        let bundle = sc.export_evidence(&second.id).unwrap();
        assert!(bundle.hash_verified);
        assert_eq!(bundle.valid_signatures, 1);
        assert_eq!(bundle.lineage.len(), 1);
        assert_eq!(bundle.lineage[0].id, first.id);
        assert_eq!(bundle.anchor, AnchorStatus::NotRequested);
        assert_eq!(bundle.record.evidence.len(), 1);
    }

    #[test]
    fn tampered_store_is_fatal() {
        let store = Arc::new(MemStore::new());
        let sc = committer(store.clone());
        let rec = sc.commit_state("d", 1, &json!({"v": 1}), plan_link(b"1"), vec![]).unwrap();
        let mut forged = rec.clone();
        forged.artifact = json!({"v": 999});
        store.tamper(rec.hash, &forged).unwrap();

        let err = sc.verify_record(&rec.id).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn missing_state_is_not_found() {
        let sc = committer(Arc::new(MemStore::new()));
        assert!(matches!(
            sc.query_lineage(&StateId::new("d", 9)),
            Err(CommitError::NotFound(_))
        ));
    }
}
