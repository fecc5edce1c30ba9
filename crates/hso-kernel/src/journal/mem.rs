use std::sync::{Arc, Mutex};

use super::{Journal, JournalEntry, JournalError, JournalSeq, OwnedJournalEntry};

/// In-memory journal for tests and ephemeral schedulers.
#[derive(Debug, Default, Clone)]
pub struct MemJournal {
    entries: Arc<Mutex<Vec<OwnedJournalEntry>>>,
}

impl MemJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Result<Vec<OwnedJournalEntry>, JournalError> {
        let guard = self.entries.lock().map_err(|_| JournalError::Poisoned)?;
        Ok(guard.clone())
    }
}

impl Journal for MemJournal {
    fn append(&mut self, entry: JournalEntry<'_>) -> Result<JournalSeq, JournalError> {
        let mut guard = self.entries.lock().map_err(|_| JournalError::Poisoned)?;
        let seq = guard.len() as JournalSeq;
        guard.push(OwnedJournalEntry {
            seq,
            kind: entry.kind,
            payload: entry.payload.to_vec(),
        });
        Ok(seq)
    }

    fn load_from(&self, from: JournalSeq) -> Result<Vec<OwnedJournalEntry>, JournalError> {
        Ok(self
            .entries()?
            .into_iter()
            .filter(|entry| entry.seq >= from)
            .collect())
    }

    fn next_seq(&self) -> JournalSeq {
        self.entries
            .lock()
            .map(|guard| guard.len() as JournalSeq)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::JournalKind;

    #[test]
    fn append_assigns_dense_sequence() {
        let mut journal = MemJournal::new();
        journal
            .append(JournalEntry::new(JournalKind::CycleStarted, b"start"))
            .unwrap();
        journal
            .append(JournalEntry::new(JournalKind::CycleEnded, b"end"))
            .unwrap();

        let tail = journal.load_from(1).unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].seq, 1);
        assert_eq!(tail[0].kind, JournalKind::CycleEnded);
        assert_eq!(tail[0].payload, b"end");
        assert_eq!(journal.next_seq(), 2);
    }
}
