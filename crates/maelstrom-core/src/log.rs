//! # log
//!
//! why: manage the append-only log of commands that raft replicates
//! relations: owned by node.rs, persisted through a Storage implementation
//! what: LogEntry, DurableLog (cached view over storage with conflict-checked appends)

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{LogIndex, RaftError, RaftResult, Storage, StorageError, Term};

/// A single entry in the replicated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The term when this entry was created
    pub term: Term,
    /// The index of this entry in the log (1-indexed)
    pub index: LogIndex,
    /// Opaque payload for the state machine; empty for a leader no-op
    pub command: Vec<u8>,
}

impl LogEntry {
    /// Create a new log entry
    pub fn new(term: Term, index: LogIndex, command: Vec<u8>) -> Self {
        Self { term, index, command }
    }

    /// No-op entry a fresh leader appends in its own term
    pub fn noop(term: Term, index: LogIndex) -> Self {
        Self::new(term, index, Vec::new())
    }

    pub fn is_noop(&self) -> bool {
        self.command.is_empty()
    }
}

/// The node's log: an in-memory copy of every entry in front of a Storage.
///
/// Mutations hit storage first and only touch the cache once storage has
/// accepted them, so the cache never runs ahead of what is durable.
pub struct DurableLog<S> {
    storage: S,
    entries: Vec<LogEntry>,
}

impl<S: Storage> DurableLog<S> {
    /// Load the persisted log, checking it is a contiguous run from index 1.
    pub fn open(storage: S) -> RaftResult<Self> {
        let entries = storage.load_log()?;
        for (position, entry) in entries.iter().enumerate() {
            let expected = position as LogIndex + 1;
            if entry.index != expected {
                return Err(StorageError::Corrupt(format!(
                    "log entry at position {position} has index {}, expected {expected}",
                    entry.index
                ))
                .into());
            }
        }
        Ok(Self { storage, entries })
    }

    /// Append `entries`, which must be consecutive and start at or below
    /// `last_index() + 1`.
    ///
    /// Entries already present with the same term are skipped. An existing
    /// entry with a different term is a `LogConflict`; the caller has to
    /// truncate first. Returns once the new suffix is durable.
    pub fn append(&mut self, entries: &[LogEntry]) -> RaftResult<()> {
        let Some(first) = entries.first() else {
            return Ok(());
        };
        let next = self.last_index() + 1;
        if first.index == 0 || first.index > next {
            return Err(RaftError::LogGap { expected: next, got: first.index });
        }

        let mut fresh_from = entries.len();
        for (offset, entry) in entries.iter().enumerate() {
            let expected = first.index + offset as LogIndex;
            if entry.index != expected {
                return Err(RaftError::LogGap { expected, got: entry.index });
            }
            match self.term_at(entry.index) {
                Some(existing) if existing == entry.term => {}
                Some(existing) => {
                    return Err(RaftError::LogConflict {
                        index: entry.index,
                        existing_term: existing,
                        incoming_term: entry.term,
                    });
                }
                None => {
                    fresh_from = fresh_from.min(offset);
                }
            }
        }

        let fresh = &entries[fresh_from..];
        if fresh.is_empty() {
            return Ok(());
        }
        self.storage.append_entries(fresh)?;
        self.entries.extend(fresh.iter().cloned());
        debug!(
            first = fresh[0].index,
            last = self.last_index(),
            "appended log entries"
        );
        Ok(())
    }

    /// Remove every entry with index >= `from_index`.
    pub fn truncate_suffix(&mut self, from_index: LogIndex) -> RaftResult<()> {
        let from_index = from_index.max(1);
        if from_index > self.last_index() {
            return Ok(());
        }
        self.storage.truncate_log_from(from_index)?;
        self.entries.truncate((from_index - 1) as usize);
        debug!(from_index, "truncated log suffix");
        Ok(())
    }

    pub fn entry_at(&self, index: LogIndex) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get((index - 1) as usize)
    }

    /// Term of the entry at `index`; index 0 has term 0.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        self.entry_at(index).map(|e| e.term)
    }

    pub fn last_index_and_term(&self) -> (LogIndex, Term) {
        self.entries.last().map_or((0, 0), |e| (e.index, e.term))
    }

    pub fn last_index(&self) -> LogIndex {
        self.last_index_and_term().0
    }

    pub fn last_term(&self) -> Term {
        self.last_index_and_term().1
    }

    /// Entries in the inclusive range `from..=to`, clipped to what exists.
    pub fn entries(&self, from: LogIndex, to: LogIndex) -> &[LogEntry] {
        let from = from.max(1);
        let to = to.min(self.last_index());
        if from > to {
            return &[];
        }
        &self.entries[(from - 1) as usize..to as usize]
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }
}
