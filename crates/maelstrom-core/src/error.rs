//! # error
//!
//! why: give every failure of the engine a name so callers can tell retryable from fatal
//! relations: returned by log.rs, node.rs and every Storage implementation
//! what: StorageError (device level), RaftError (protocol level), RaftResult alias

use thiserror::Error;

use crate::{LogIndex, NodeId, Term};

/// Failures of the durable storage device.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt storage: {0}")]
    Corrupt(String),

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Result type for engine operations
pub type RaftResult<T> = Result<T, RaftError>;

/// Errors produced by the consensus engine.
///
/// Only `Durability` and `Halted` are fatal to a node; everything else is a
/// normal outcome of running a distributed protocol. Stale-term messages are
/// not errors at all: they get a rejecting reply carrying the current term.
#[derive(Debug, Error)]
pub enum RaftError {
    #[error("log conflict at index {index}: existing term {existing_term}, incoming term {incoming_term}")]
    LogConflict {
        index: LogIndex,
        existing_term: Term,
        incoming_term: Term,
    },

    #[error("log gap: expected index {expected}, got {got}")]
    LogGap { expected: LogIndex, got: LogIndex },

    #[error("not the leader (leader hint: {leader_hint:?})")]
    NotLeader { leader_hint: Option<NodeId> },

    #[error("durability failure: {0}")]
    Durability(#[from] StorageError),

    #[error("node halted after a durability failure")]
    Halted,

    #[error("invalid command payload: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl RaftError {
    /// True for errors after which the node must stop participating.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RaftError::Durability(_) | RaftError::Halted)
    }
}
