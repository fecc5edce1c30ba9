use crate::{StateStore, StoreError, StoreResult, decode_verified};
use hso_cbor::{Hash, to_canonical_cbor};
use hso_contracts::{AnchorRef, StateId, StateRecord};
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

#[derive(Default)]
struct Inner {
    records: HashMap<Hash, Vec<u8>>,
    ids: HashMap<StateId, Hash>,
    heads: HashMap<String, (u64, Hash)>,
    anchors: HashMap<Hash, AnchorRef>,
}

#[derive(Clone, Default)]
pub struct MemStore {
    inner: Arc<RwLock<Inner>>,
}

impl std::fmt::Debug for MemStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut dbg = f.debug_struct("MemStore");
        if let Ok(inner) = self.inner.read() {
            dbg.field("records", &inner.records.len())
                .field("domains", &inner.heads.len());
        }
        dbg.finish()
    }
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite stored bytes for a record without any checks. Test helper for
    /// simulating on-disk corruption.
    #[doc(hidden)]
    pub fn tamper(&self, hash: Hash, record: &StateRecord) -> StoreResult<()> {
        let bytes = serde_cbor::to_vec(record)?;
        let mut guard = self.inner.write().map_err(|_| StoreError::Poisoned)?;
        guard.records.insert(hash, bytes);
        Ok(())
    }

    fn load(&self, hash: Hash) -> StoreResult<Option<StateRecord>> {
        let bytes = {
            let guard = self.inner.read().map_err(|_| StoreError::Poisoned)?;
            match guard.records.get(&hash) {
                Some(bytes) => bytes.clone(),
                None => return Ok(None),
            }
        };
        let mut record = decode_verified(&bytes)?;
        record.utcs_anchor = self.get_anchor(hash)?;
        Ok(Some(record))
    }
}

impl StateStore for MemStore {
    fn put_record(&self, record: &StateRecord) -> StoreResult<()> {
        let bytes = to_canonical_cbor(record)?;
        let mut guard = self.inner.write().map_err(|_| StoreError::Poisoned)?;
        if let Some(existing) = guard.ids.get(&record.id) {
            if *existing == record.hash {
                return Ok(());
            }
            return Err(StoreError::Conflict {
                id: record.id.clone(),
            });
        }
        if let Some((head_cycle, _)) = guard.heads.get(&record.domain) {
            if *head_cycle >= record.cycle_id {
                return Err(StoreError::OutOfOrder {
                    id: record.id.clone(),
                    head_cycle: *head_cycle,
                });
            }
        }
        guard.records.entry(record.hash).or_insert(bytes);
        guard.ids.insert(record.id.clone(), record.hash);
        guard
            .heads
            .insert(record.domain.clone(), (record.cycle_id, record.hash));
        Ok(())
    }

    fn get_record(&self, id: &StateId) -> StoreResult<Option<StateRecord>> {
        let hash = {
            let guard = self.inner.read().map_err(|_| StoreError::Poisoned)?;
            guard.ids.get(id).copied()
        };
        match hash {
            Some(hash) => self.load(hash),
            None => Ok(None),
        }
    }

    fn get_by_hash(&self, hash: Hash) -> StoreResult<Option<StateRecord>> {
        self.load(hash)
    }

    fn latest(&self, domain: &str) -> StoreResult<Option<StateRecord>> {
        let head = {
            let guard = self.inner.read().map_err(|_| StoreError::Poisoned)?;
            guard.heads.get(domain).map(|(_, hash)| *hash)
        };
        match head {
            Some(hash) => self.load(hash),
            None => Ok(None),
        }
    }

    fn put_anchor(&self, hash: Hash, anchor: &AnchorRef) -> StoreResult<()> {
        let mut guard = self.inner.write().map_err(|_| StoreError::Poisoned)?;
        if !guard.records.contains_key(&hash) {
            return Err(StoreError::UnknownRecord(hash));
        }
        guard.anchors.entry(hash).or_insert_with(|| anchor.clone());
        Ok(())
    }

    fn get_anchor(&self, hash: Hash) -> StoreResult<Option<AnchorRef>> {
        let guard = self.inner.read().map_err(|_| StoreError::Poisoned)?;
        Ok(guard.anchors.get(&hash).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::record;

    #[test]
    fn record_round_trip_and_head() {
        let store = MemStore::new();
        let first = record("east", 1, None);
        let second = record("east", 2, Some(&first));
        store.put_record(&first).expect("put");
        store.put_record(&second).expect("put");

        let loaded = store.get_record(&first.id).expect("get").expect("present");
        assert_eq!(loaded, first);
        assert_eq!(store.latest("east").unwrap().unwrap().id, second.id);
        assert_eq!(store.get_by_hash(second.hash).unwrap().unwrap().id, second.id);
        assert!(store.latest("west").unwrap().is_none());
    }

    #[test]
    fn heads_only_advance() {
        let store = MemStore::new();
        let later = record("east", 5, None);
        store.put_record(&later).unwrap();
        let err = store.put_record(&record("east", 4, None)).unwrap_err();
        assert!(matches!(err, StoreError::OutOfOrder { head_cycle: 5, .. }));
        // Same record again is idempotent.
        store.put_record(&later).unwrap();
    }

    #[test]
    fn tampered_bytes_fail_verification() {
        let store = MemStore::new();
        let rec = record("east", 1, None);
        store.put_record(&rec).unwrap();
        let mut forged = rec.clone();
        forged.artifact["objective"] = serde_json::json!(-100.0);
        store.tamper(rec.hash, &forged).unwrap();
        let err = store.get_record(&rec.id).unwrap_err();
        assert!(matches!(err, StoreError::HashMismatch { .. }));
    }

    #[test]
    fn anchors_attach_once() {
        let store = MemStore::new();
        let rec = record("east", 1, None);
        store.put_record(&rec).unwrap();
        let anchor = AnchorRef {
            ledger: "mem".into(),
            tx_ref: "tx-1".into(),
            anchored_at_ms: 10,
        };
        store.put_anchor(rec.hash, &anchor).unwrap();
        store
            .put_anchor(
                rec.hash,
                &AnchorRef {
                    tx_ref: "tx-2".into(),
                    ..anchor.clone()
                },
            )
            .unwrap();
        let loaded = store.get_record(&rec.id).unwrap().unwrap();
        assert_eq!(loaded.utcs_anchor, Some(anchor));
        assert!(matches!(
            store.put_anchor(Hash::of_bytes(b"nope"), &loaded.utcs_anchor.clone().unwrap()),
            Err(StoreError::UnknownRecord(_))
        ));
    }
}
