//! Canonical CBOR helpers and stable SHA-256 hashing used for state provenance.
//!
//! Two encodings are provided:
//! - [`to_canonical_cbor`]: deterministic map ordering, values untouched.
//! - [`to_normalized_cbor`]: canonical ordering plus whitespace normalization of every
//!   text value and map key. Committed state hashes are computed over this form so
//!   cosmetic whitespace differences in inputs never change a record's identity.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_cbor::{ser::Write as CborWrite, value::Value as CborValue};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Prefix for serialized hashes (e.g. `sha256:deadbeef`).
pub const HASH_PREFIX: &str = "sha256:";

/// Serialize a value into canonical CBOR bytes (sorted map keys, self-described).
pub fn to_canonical_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_cbor::Error> {
    let mut buf = Vec::with_capacity(256);
    write_canonical_cbor(value, &mut buf)?;
    Ok(buf)
}

/// Serialize a value directly into an arbitrary CBOR writer using canonical settings.
pub fn write_canonical_cbor<T: Serialize, W>(value: &T, writer: W) -> Result<(), serde_cbor::Error>
where
    W: CborWrite,
{
    let canonical_value: CborValue = serde_cbor::value::to_value(value)?;
    write_value(&canonical_value, writer)
}

/// Serialize a value into canonical CBOR after normalizing whitespace in all text.
pub fn to_normalized_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_cbor::Error> {
    let normalized = normalize_value(serde_cbor::value::to_value(value)?);
    let mut buf = Vec::with_capacity(256);
    write_value(&normalized, &mut buf)?;
    Ok(buf)
}

fn write_value<W: CborWrite>(value: &CborValue, writer: W) -> Result<(), serde_cbor::Error> {
    let mut serializer = serde_cbor::ser::Serializer::new(writer);
    serializer.self_describe()?;
    value.serialize(&mut serializer)
}

/// Trim and collapse interior runs of whitespace to a single ASCII space.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Recursively normalize text values and map keys.
///
/// Map keys that collide after normalization keep the entry whose original key sorts
/// last; colliding keys are a caller bug and the result stays deterministic.
pub fn normalize_value(value: CborValue) -> CborValue {
    match value {
        CborValue::Text(text) => CborValue::Text(normalize_text(&text)),
        CborValue::Array(items) => {
            CborValue::Array(items.into_iter().map(normalize_value).collect())
        }
        CborValue::Map(entries) => {
            let mut out = BTreeMap::new();
            for (key, val) in entries {
                out.insert(normalize_value(key), normalize_value(val));
            }
            CborValue::Map(out)
        }
        CborValue::Tag(tag, inner) => CborValue::Tag(tag, Box::new(normalize_value(*inner))),
        other => other,
    }
}

/// Wrapper around a 32-byte SHA-256 digest used for content addressing.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash([u8; 32]);

impl Hash {
    /// Compute the hash of a value's canonical CBOR encoding.
    pub fn of_cbor<T: Serialize>(value: &T) -> Result<Self, serde_cbor::Error> {
        Ok(Self::of_bytes(&to_canonical_cbor(value)?))
    }

    /// Compute the hash of a value's whitespace-normalized canonical encoding.
    pub fn of_normalized<T: Serialize>(value: &T) -> Result<Self, serde_cbor::Error> {
        Ok(Self::of_bytes(&to_normalized_cbor(value)?))
    }

    /// Compute the hash of the provided byte slice.
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        let digest = hasher.finalize();
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&digest);
        Hash(arr)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Render the digest as a `sha256:...` hex string.
    pub fn to_hex(&self) -> String {
        format!("{HASH_PREFIX}{}", hex::encode(self.0))
    }

    /// First eight hex characters, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }

    /// Parse a hash from its `sha256:`-prefixed hex string representation.
    pub fn from_hex_str(s: &str) -> Result<Self, HashParseError> {
        let rest = s.strip_prefix(HASH_PREFIX).ok_or(HashParseError::MissingPrefix)?;
        if rest.len() != 64 {
            return Err(HashParseError::InvalidLength(rest.len()));
        }
        let mut buf = [0u8; 32];
        hex::decode_to_slice(rest, &mut buf).map_err(HashParseError::InvalidHex)?;
        Ok(Hash(buf))
    }

    /// Attempt to build a hash from raw bytes, ensuring the length matches.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, HashLengthError> {
        if bytes.len() != 32 {
            return Err(HashLengthError(bytes.len()));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(bytes);
        Ok(Hash(arr))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Hash").field(&self.to_hex()).finish()
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl From<[u8; 32]> for Hash {
    fn from(value: [u8; 32]) -> Self {
        Hash(value)
    }
}

impl From<Hash> for [u8; 32] {
    fn from(value: Hash) -> Self {
        value.0
    }
}

impl AsRef<[u8; 32]> for Hash {
    fn as_ref(&self) -> &[u8; 32] {
        &self.0
    }
}

impl TryFrom<&str> for Hash {
    type Error = HashParseError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Hash::from_hex_str(value)
    }
}

impl std::str::FromStr for Hash {
    type Err = HashParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Hash::from_hex_str(s)
    }
}

// Hashes travel as `sha256:` strings in records and envelopes.
impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Hash::from_hex_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Error returned when a `sha256:` string is malformed.
#[derive(Debug, thiserror::Error)]
pub enum HashParseError {
    #[error("hash string missing '{HASH_PREFIX}' prefix")]
    MissingPrefix,
    #[error("hash hex length must be 64, got {0}")]
    InvalidLength(usize),
    #[error("invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

/// Error returned when attempting to create a hash from the wrong byte length.
#[derive(Debug, thiserror::Error)]
#[error("hash must be 32 bytes, got {0}")]
pub struct HashLengthError(pub usize);

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn map_insertion_order_does_not_change_hash() {
        let mut a = HashMap::new();
        a.insert("alpha", 1);
        a.insert("beta", 2);
        a.insert("gamma", 3);
        let mut b = HashMap::new();
        b.insert("gamma", 3);
        b.insert("alpha", 1);
        b.insert("beta", 2);
        assert_eq!(Hash::of_cbor(&a).unwrap(), Hash::of_cbor(&b).unwrap());
    }

    #[test]
    fn normalized_hash_ignores_whitespace_noise() {
        let tidy = json!({"domain": "grid east", "notes": ["a b", "c"]});
        let noisy = json!({" domain ": "grid   east\n", "notes": ["a\tb", "  c"]});
        assert_ne!(Hash::of_cbor(&tidy).unwrap(), Hash::of_cbor(&noisy).unwrap());
        assert_eq!(
            Hash::of_normalized(&tidy).unwrap(),
            Hash::of_normalized(&noisy).unwrap()
        );
    }

    #[test]
    fn normalized_encoding_still_decodes() {
        let value = json!({"k": "  spaced   out  ", "n": 4});
        let bytes = to_normalized_cbor(&value).unwrap();
        let decoded: serde_json::Value = serde_cbor::from_slice(&bytes).unwrap();
        assert_eq!(decoded, json!({"k": "spaced out", "n": 4}));
    }

    #[test]
    fn parse_and_format_round_trip() {
        let original = "sha256:0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";
        let hash = Hash::from_hex_str(original).expect("parse");
        assert_eq!(hash.to_hex(), original);
        assert_eq!(hash.short(), "01234567");
        assert!(Hash::from_hex_str("0123").is_err());
        assert!(Hash::from_bytes(&[0u8; 31]).is_err());
    }

    #[test]
    fn hash_serializes_as_prefixed_string() {
        let hash = Hash::of_bytes(b"record");
        let encoded = serde_json::to_string(&hash).unwrap();
        assert_eq!(encoded, format!("\"{}\"", hash.to_hex()));
        let back: Hash = serde_json::from_str(&encoded).unwrap();
        assert_eq!(back, hash);
    }
}
