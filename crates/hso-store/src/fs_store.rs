use crate::{StateStore, StoreError, StoreResult, decode_verified, io_error};
use hso_cbor::{Hash, to_canonical_cbor};
use hso_contracts::{AnchorRef, StateId, StateRecord};
use std::{
    fmt,
    fs::{self, OpenOptions},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

/// Filesystem-backed store rooted at `<root>/.state`.
///
/// Layout:
/// - `records/sha256/<hex>`: canonical CBOR record bytes, written once
/// - `index/<hex(state id)>`: hash string of the record for that id
/// - `heads/<hex(domain)>`: `<cycle_id> <hash>` of the latest record
/// - `anchors/<hex>`: canonical CBOR [`AnchorRef`], written once
pub struct FsStore {
    records_dir: PathBuf,
    index_dir: PathBuf,
    heads_dir: PathBuf,
    anchors_dir: PathBuf,
    // Serializes head read-modify-write within this process.
    head_lock: Mutex<()>,
}

impl fmt::Debug for FsStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FsStore")
            .field("records_dir", &self.records_dir)
            .field("heads_dir", &self.heads_dir)
            .finish()
    }
}

impl FsStore {
    pub fn open(root: impl AsRef<Path>) -> StoreResult<Self> {
        let state_root = root.as_ref().join(".state");
        let records_dir = state_root.join("records").join("sha256");
        let index_dir = state_root.join("index");
        let heads_dir = state_root.join("heads");
        let anchors_dir = state_root.join("anchors");
        for dir in [&records_dir, &index_dir, &heads_dir, &anchors_dir] {
            fs::create_dir_all(dir).map_err(|e| io_error(dir, e))?;
        }
        Ok(Self {
            records_dir,
            index_dir,
            heads_dir,
            anchors_dir,
            head_lock: Mutex::new(()),
        })
    }

    fn write_once(path: &Path, bytes: &[u8]) -> StoreResult<bool> {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                file.write_all(bytes).map_err(|e| io_error(path, e))?;
                file.sync_all().map_err(|e| io_error(path, e))?;
                Ok(true)
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(err) => Err(io_error(path, err)),
        }
    }

    /// Replace `path` atomically via a sibling temp file.
    fn write_replace(path: &Path, bytes: &[u8]) -> StoreResult<()> {
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes).map_err(|e| io_error(&tmp, e))?;
        fs::rename(&tmp, path).map_err(|e| io_error(path, e))
    }

    fn read_optional(path: &Path) -> StoreResult<Option<Vec<u8>>> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_error(path, err)),
        }
    }

    fn record_path(&self, hash: &Hash) -> PathBuf {
        self.records_dir.join(hex::encode(hash.as_bytes()))
    }

    fn index_path(&self, id: &StateId) -> PathBuf {
        self.index_dir.join(hex::encode(id.as_str()))
    }

    fn head_path(&self, domain: &str) -> PathBuf {
        self.heads_dir.join(hex::encode(domain))
    }

    fn anchor_path(&self, hash: &Hash) -> PathBuf {
        self.anchors_dir.join(hex::encode(hash.as_bytes()))
    }

    fn parse_hash(text: &str) -> StoreResult<Hash> {
        let trimmed = text.trim();
        trimmed
            .parse::<Hash>()
            .map_err(|source| StoreError::InvalidHashString {
                value: trimmed.to_string(),
                source,
            })
    }

    fn read_head(&self, domain: &str) -> StoreResult<Option<(u64, Hash)>> {
        let path = self.head_path(domain);
        let Some(bytes) = Self::read_optional(&path)? else {
            return Ok(None);
        };
        let text = String::from_utf8_lossy(&bytes);
        let (cycle, hash) = text
            .trim()
            .split_once(' ')
            .ok_or_else(|| io_error(&path, std::io::Error::other("malformed head pointer")))?;
        let cycle = cycle
            .parse::<u64>()
            .map_err(|e| io_error(&path, std::io::Error::other(e)))?;
        Ok(Some((cycle, Self::parse_hash(hash)?)))
    }

    fn load(&self, hash: Hash) -> StoreResult<Option<StateRecord>> {
        let Some(bytes) = Self::read_optional(&self.record_path(&hash))? else {
            return Ok(None);
        };
        let mut record = decode_verified(&bytes)?;
        record.utcs_anchor = self.get_anchor(hash)?;
        Ok(Some(record))
    }
}

impl StateStore for FsStore {
    fn put_record(&self, record: &StateRecord) -> StoreResult<()> {
        let _guard = self.head_lock.lock().map_err(|_| StoreError::Poisoned)?;
        let index_path = self.index_path(&record.id);
        if let Some(existing) = Self::read_optional(&index_path)? {
            let existing = Self::parse_hash(&String::from_utf8_lossy(&existing))?;
            if existing == record.hash {
                return Ok(());
            }
            return Err(StoreError::Conflict {
                id: record.id.clone(),
            });
        }
        if let Some((head_cycle, _)) = self.read_head(&record.domain)? {
            if head_cycle >= record.cycle_id {
                return Err(StoreError::OutOfOrder {
                    id: record.id.clone(),
                    head_cycle,
                });
            }
        }

        let bytes = to_canonical_cbor(record)?;
        Self::write_once(&self.record_path(&record.hash), &bytes)?;
        Self::write_once(&index_path, record.hash.to_string().as_bytes())?;
        let head = format!("{} {}", record.cycle_id, record.hash);
        Self::write_replace(&self.head_path(&record.domain), head.as_bytes())
    }

    fn get_record(&self, id: &StateId) -> StoreResult<Option<StateRecord>> {
        let Some(bytes) = Self::read_optional(&self.index_path(id))? else {
            return Ok(None);
        };
        let hash = Self::parse_hash(&String::from_utf8_lossy(&bytes))?;
        self.load(hash)
    }

    fn get_by_hash(&self, hash: Hash) -> StoreResult<Option<StateRecord>> {
        self.load(hash)
    }

    fn latest(&self, domain: &str) -> StoreResult<Option<StateRecord>> {
        match self.read_head(domain)? {
            Some((_, hash)) => self.load(hash),
            None => Ok(None),
        }
    }

    fn put_anchor(&self, hash: Hash, anchor: &AnchorRef) -> StoreResult<()> {
        if !self.record_path(&hash).exists() {
            return Err(StoreError::UnknownRecord(hash));
        }
        let bytes = to_canonical_cbor(anchor)?;
        Self::write_once(&self.anchor_path(&hash), &bytes)?;
        Ok(())
    }

    fn get_anchor(&self, hash: Hash) -> StoreResult<Option<AnchorRef>> {
        match Self::read_optional(&self.anchor_path(&hash))? {
            Some(bytes) => Ok(Some(serde_cbor::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}
