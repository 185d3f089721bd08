//! # maelstrom-core
//!
//! why: implement the raft consensus engine behind maelstromdb in pure, synchronous rust
//! relations: driven by maelstrom-server's decision loop, persisted through maelstrom-storage
//! what: durable log facade, storage trait, election + replication state machine, kv state machine

pub mod config;
pub mod error;
pub mod log;
pub mod message;
pub mod node;
pub mod state_machine;
pub mod storage;

pub use config::{ClusterConfig, RaftConfig};
pub use error::{RaftError, RaftResult, StorageError};
pub use log::{DurableLog, LogEntry};
pub use message::{
    AppendEntriesRequest, AppendEntriesResponse, Envelope, RaftMessage, VoteRequest, VoteResponse,
};
pub use node::{NodeState, NodeStatus, PeerView, Progress, RaftNode};
pub use state_machine::{Command, CommandOutput, KvStore};
pub use storage::{HardState, InMemoryStorage, Storage};

/// Identity of a cluster member.
pub type NodeId = u64;

/// Election epoch. Only ever increases on a given node.
pub type Term = u64;

/// 1-based position in the replicated log. 0 means "no entries".
pub type LogIndex = u64;
