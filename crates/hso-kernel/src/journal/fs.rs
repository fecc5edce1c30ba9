use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use hso_cbor::to_canonical_cbor;

use super::{DiskRecord, Journal, JournalEntry, JournalError, JournalSeq, OwnedJournalEntry};

const JOURNAL_DIR: &str = "journal";
const JOURNAL_FILE: &str = "cycles.log";

/// Filesystem journal of length-prefixed canonical CBOR entries.
#[derive(Debug)]
pub struct FsJournal {
    path: PathBuf,
    next_seq: JournalSeq,
}

impl FsJournal {
    pub fn open(root: impl AsRef<Path>) -> Result<Self, JournalError> {
        let dir = root.as_ref().join(JOURNAL_DIR);
        fs::create_dir_all(&dir)?;
        let path = dir.join(JOURNAL_FILE);
        if !path.exists() {
            File::create(&path)?;
        }
        let next_seq = read_entries(&path)?
            .last()
            .map(|entry| entry.seq + 1)
            .unwrap_or(0);
        Ok(Self { path, next_seq })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Journal for FsJournal {
    fn append(&mut self, entry: JournalEntry<'_>) -> Result<JournalSeq, JournalError> {
        let seq = self.next_seq;
        let bytes = to_canonical_cbor(&DiskRecord {
            seq,
            kind: entry.kind,
            payload: entry.payload,
        })?;
        let len = u32::try_from(bytes.len())
            .map_err(|_| JournalError::Corrupt("entry larger than 4GiB".into()))?;
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        let mut frame = Vec::with_capacity(bytes.len() + 4);
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&bytes);
        file.write_all(&frame)?;
        file.sync_data()?;
        self.next_seq += 1;
        Ok(seq)
    }

    fn load_from(&self, from: JournalSeq) -> Result<Vec<OwnedJournalEntry>, JournalError> {
        let mut entries = read_entries(&self.path)?;
        entries.retain(|entry| entry.seq >= from);
        Ok(entries)
    }

    fn next_seq(&self) -> JournalSeq {
        self.next_seq
    }
}

fn read_entries(path: &Path) -> Result<Vec<OwnedJournalEntry>, JournalError> {
    let mut file = File::open(path)?;
    let mut entries = Vec::new();
    loop {
        let mut len_buf = [0u8; 4];
        match file.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => {
                // Distinguish a clean end from a torn header.
                let pos = file.metadata()?.len();
                let consumed = entries_len(&entries);
                if pos == consumed {
                    break;
                }
                return Err(JournalError::Corrupt(format!(
                    "truncated length header at byte {consumed}"
                )));
            }
            Err(err) => return Err(err.into()),
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut buf = vec![0u8; len];
        if let Err(err) = file.read_exact(&mut buf) {
            if err.kind() == ErrorKind::UnexpectedEof {
                return Err(JournalError::Corrupt("truncated entry payload".into()));
            }
            return Err(err.into());
        }
        let entry: OwnedJournalEntry = serde_cbor::from_slice(&buf)?;
        entries.push((entry, len as u64 + 4));
    }
    Ok(entries.into_iter().map(|(entry, _)| entry).collect())
}

fn entries_len(entries: &[(OwnedJournalEntry, u64)]) -> u64 {
    entries.iter().map(|(_, len)| len).sum()
}
