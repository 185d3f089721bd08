//! # state_machine
//!
//! why: turn the committed log into a key-value map, identically on every node
//! relations: fed committed entries by the server's decision loop, payloads built by clients
//! what: Command (json payload), CommandOutput, KvStore

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::{LogEntry, LogIndex, RaftResult};

/// Operation carried in a log entry's payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    Put { key: String, value: String },
    Delete { key: String },
    Get { key: String },
}

impl Command {
    pub fn put(key: impl Into<String>, value: impl Into<String>) -> Self {
        Command::Put { key: key.into(), value: value.into() }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Command::Delete { key: key.into() }
    }

    pub fn get(key: impl Into<String>) -> Self {
        Command::Get { key: key.into() }
    }

    pub fn encode(&self) -> RaftResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> RaftResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn key(&self) -> &str {
        match self {
            Command::Put { key, .. } | Command::Delete { key } | Command::Get { key } => key,
        }
    }
}

/// What applying one entry produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandOutput {
    Written,
    Deleted { existed: bool },
    Value(Option<String>),
    /// Leader no-op, nothing to do
    Noop,
    /// Payload could not be decoded. Every node sees the same bytes, so every
    /// node records the same outcome.
    Invalid { reason: String },
}

/// Deterministic key-value state machine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KvStore {
    data: BTreeMap<String, String>,
    last_applied: LogIndex,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one committed entry. Entries must arrive in log order; an entry
    /// at or below `last_applied` is ignored and reported as `Noop`.
    pub fn apply(&mut self, entry: &LogEntry) -> CommandOutput {
        if entry.index <= self.last_applied {
            warn!(index = entry.index, last_applied = self.last_applied, "entry already applied");
            return CommandOutput::Noop;
        }
        self.last_applied = entry.index;

        if entry.is_noop() {
            return CommandOutput::Noop;
        }
        let command = match Command::decode(&entry.command) {
            Ok(command) => command,
            Err(err) => {
                warn!(index = entry.index, error = %err, "undecodable command");
                return CommandOutput::Invalid { reason: err.to_string() };
            }
        };
        trace!(index = entry.index, ?command, "applying");

        match command {
            Command::Put { key, value } => {
                self.data.insert(key, value);
                CommandOutput::Written
            }
            Command::Delete { key } => CommandOutput::Deleted {
                existed: self.data.remove(&key).is_some(),
            },
            Command::Get { key } => CommandOutput::Value(self.data.get(&key).cloned()),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }

    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Copy of every key and value, ordered by key.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.data.clone()
    }
}
