//! # storage
//!
//! why: draw an explicit durable-write boundary between the engine and the device
//! relations: called by log.rs and node.rs; FileStorage lives in maelstrom-storage
//! what: Storage trait, HardState, InMemoryStorage for tests and benchmarks

use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::{LogEntry, LogIndex, NodeId, StorageError, Term};

/// The persisted (term, vote) pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub term: Term,
    pub voted_for: Option<NodeId>,
}

/// Durable storage of raft state.
///
/// Every mutating call returns only once its data would survive a crash.
/// The engine relies on this to never acknowledge a vote or an append
/// before it is on stable storage.
pub trait Storage {
    /// persist the current term and voted_for
    fn save_term_and_vote(&mut self, term: Term, voted_for: Option<NodeId>) -> Result<(), StorageError>;

    /// load the persisted term and voted_for, defaults for a fresh node
    fn load_term_and_vote(&self) -> Result<HardState, StorageError>;

    /// append entries to the end of the log
    fn append_entries(&mut self, entries: &[LogEntry]) -> Result<(), StorageError>;

    /// load all log entries (for crash recovery)
    fn load_log(&self) -> Result<Vec<LogEntry>, StorageError>;

    /// drop every entry with index >= from_index
    fn truncate_log_from(&mut self, from_index: LogIndex) -> Result<(), StorageError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    hard_state: HardState,
    log: Vec<LogEntry>,
    fail_writes: bool,
}

/// Volatile storage shared between clones.
///
/// Cloning hands out another handle to the same state, which lets tests
/// "restart" a node on top of what it persisted before crashing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStorage {
    inner: Arc<Mutex<MemoryState>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage that starts out holding `log` and `hard_state`.
    pub fn with_state(hard_state: HardState, log: Vec<LogEntry>) -> Self {
        let storage = Self::new();
        {
            let mut state = storage.lock();
            state.hard_state = hard_state;
            state.log = log;
        }
        storage
    }

    /// Make every later write fail, simulating a dead device.
    pub fn set_fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        // a panic while holding the lock leaves plain data behind; keep using it
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn writable(&self) -> Result<MutexGuard<'_, MemoryState>, StorageError> {
        let state = self.lock();
        if state.fail_writes {
            return Err(StorageError::Unavailable("writes disabled".to_string()));
        }
        Ok(state)
    }
}

impl Storage for InMemoryStorage {
    fn save_term_and_vote(&mut self, term: Term, voted_for: Option<NodeId>) -> Result<(), StorageError> {
        self.writable()?.hard_state = HardState { term, voted_for };
        Ok(())
    }

    fn load_term_and_vote(&self) -> Result<HardState, StorageError> {
        Ok(self.lock().hard_state)
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> Result<(), StorageError> {
        self.writable()?.log.extend(entries.iter().cloned());
        Ok(())
    }

    fn load_log(&self) -> Result<Vec<LogEntry>, StorageError> {
        Ok(self.lock().log.clone())
    }

    fn truncate_log_from(&mut self, from_index: LogIndex) -> Result<(), StorageError> {
        self.writable()?.log.retain(|e| e.index < from_index);
        Ok(())
    }
}
