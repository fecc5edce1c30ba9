use std::fmt;

use hso_cbor::Hash;
use serde::{Deserialize, Serialize};

/// Identifier of a committed state: `<domain>/<cycle_id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateId(pub String);

impl StateId {
    pub fn new(domain: &str, cycle_id: u64) -> Self {
        Self(format!("{domain}/{cycle_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineageKind {
    Parent,
    Input,
}

/// One edge in a record's provenance: the parent state or a hashed input.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LineageLink {
    pub kind: LineageKind,
    pub label: String,
    pub hash: Hash,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_id: Option<StateId>,
}

impl LineageLink {
    pub fn parent(state_id: StateId, hash: Hash) -> Self {
        Self {
            kind: LineageKind::Parent,
            label: "parent".into(),
            hash,
            state_id: Some(state_id),
        }
    }

    pub fn input(label: impl Into<String>, hash: Hash) -> Self {
        Self {
            kind: LineageKind::Input,
            label: label.into(),
            hash,
            state_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Evidence {
    pub kind: String,
    pub hash: Hash,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub detail: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordSignature {
    pub signer: String,
    pub public_key: [u8; 32],
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

/// External ledger reference attached to an anchored record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnchorRef {
    pub ledger: String,
    pub tx_ref: String,
    pub anchored_at_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnchorTicket {
    pub hash: Hash,
    pub ticket_id: u64,
    /// True when an anchor for this hash was already requested.
    pub resubmission: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum AnchorStatus {
    NotRequested,
    Pending { attempts: u32 },
    Anchored { anchor: AnchorRef },
    Failed { attempts: u32, reason: String },
}

/// Authoritative, provenance-bearing output of a committed cycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateRecord {
    pub id: StateId,
    pub domain: String,
    pub cycle_id: u64,
    pub hash: Hash,
    pub artifact: serde_json::Value,
    pub signatures: Vec<RecordSignature>,
    pub lineage: Vec<LineageLink>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evidence: Vec<Evidence>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utcs_anchor: Option<AnchorRef>,
    pub committed_at_ms: u64,
}

impl StateRecord {
    /// Canonical hash over the artifact and its lineage. Signatures, evidence and
    /// timestamps do not participate.
    pub fn compute_hash(
        artifact: &serde_json::Value,
        lineage: &[LineageLink],
    ) -> Result<Hash, serde_cbor::Error> {
        #[derive(Serialize)]
        struct Preimage<'a> {
            artifact: &'a serde_json::Value,
            lineage: &'a [LineageLink],
        }
        Hash::of_normalized(&Preimage { artifact, lineage })
    }

    pub fn recompute_hash(&self) -> Result<Hash, serde_cbor::Error> {
        Self::compute_hash(&self.artifact, &self.lineage)
    }

    pub fn parent(&self) -> Option<&StateId> {
        self.lineage
            .iter()
            .find(|link| link.kind == LineageKind::Parent)
            .and_then(|link| link.state_id.as_ref())
    }
}

/// Read-only export of a record with its provenance chain and verification results.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvidenceBundle {
    pub record: StateRecord,
    pub lineage: Vec<StateRecord>,
    pub hash_verified: bool,
    pub valid_signatures: usize,
    pub anchor: AnchorStatus,
    pub exported_at_ms: u64,
}
