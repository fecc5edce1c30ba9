//! Ed25519 signing for state records and federation acknowledgments.

use std::collections::HashMap;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hso_contracts::RecordSignature;

/// Produces signatures over canonical payloads (record hashes, plan hashes).
pub trait StateSigner: Send + Sync {
    fn signer_id(&self) -> &str;
    fn public_key(&self) -> [u8; 32];
    fn sign(&self, payload: &[u8]) -> Vec<u8>;

    fn sign_record(&self, payload: &[u8]) -> RecordSignature {
        RecordSignature {
            signer: self.signer_id().to_string(),
            public_key: self.public_key(),
            signature: self.sign(payload),
        }
    }
}

/// Decides whether `signature` by `signer` over `payload` is acceptable.
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, signer: &str, public_key: &[u8; 32], payload: &[u8], signature: &[u8])
    -> bool;

    fn verify_record(&self, payload: &[u8], sig: &RecordSignature) -> bool {
        self.verify(&sig.signer, &sig.public_key, payload, &sig.signature)
    }
}

pub struct Ed25519Signer {
    id: String,
    key: SigningKey,
}

impl std::fmt::Debug for Ed25519Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ed25519Signer")
            .field("id", &self.id)
            .field("public_key", &hex_prefix(&self.public_key()))
            .finish()
    }
}

impl Ed25519Signer {
    pub fn from_seed(id: impl Into<String>, seed: [u8; 32]) -> Self {
        Self {
            id: id.into(),
            key: SigningKey::from_bytes(&seed),
        }
    }
}

impl StateSigner for Ed25519Signer {
    fn signer_id(&self) -> &str {
        &self.id
    }

    fn public_key(&self) -> [u8; 32] {
        self.key.verifying_key().to_bytes()
    }

    fn sign(&self, payload: &[u8]) -> Vec<u8> {
        self.key.sign(payload).to_bytes().to_vec()
    }
}

/// Ed25519 verifier with an optional directory of pinned signer keys.
///
/// A signer with a pinned key must present exactly that key. In strict mode signers
/// without a pinned key are rejected outright.
#[derive(Debug, Clone, Default)]
pub struct Ed25519Verifier {
    pinned: HashMap<String, [u8; 32]>,
    strict: bool,
}

impl Ed25519Verifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn strict() -> Self {
        Self {
            pinned: HashMap::new(),
            strict: true,
        }
    }

    pub fn pin(mut self, signer: impl Into<String>, public_key: [u8; 32]) -> Self {
        self.pinned.insert(signer.into(), public_key);
        self
    }
}

impl SignatureVerifier for Ed25519Verifier {
    fn verify(
        &self,
        signer: &str,
        public_key: &[u8; 32],
        payload: &[u8],
        signature: &[u8],
    ) -> bool {
        match self.pinned.get(signer) {
            Some(pinned) if pinned != public_key => return false,
            None if self.strict => return false,
            _ => {}
        }
        let Ok(key) = VerifyingKey::from_bytes(public_key) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        key.verify(payload, &signature).is_ok()
    }
}

fn hex_prefix(bytes: &[u8]) -> String {
    bytes[..4].iter().map(|b| format!("{b:02x}")).collect()
}
