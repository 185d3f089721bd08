//! # message
//!
//! why: define all raft rpc message types for node communication
//! relations: produced and consumed by node.rs, framed onto the wire by maelstrom-server
//! what: VoteRequest/Response, AppendEntriesRequest/Response, RaftMessage, Envelope

use serde::{Deserialize, Serialize};

use crate::{LogEntry, LogIndex, NodeId, Term};

/// Sent by a candidate to every peer when it starts an election
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}

/// Replicate log entries (also serves as heartbeat when entries is empty)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: Term,
    pub leader_id: NodeId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub leader_commit: LogIndex,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
    /// Highest index known to match the leader; meaningful only on success
    pub match_index: LogIndex,
    /// Follower's log length on a rejected consistency check
    pub conflict_index: Option<LogIndex>,
}

/// All possible Raft messages between nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftMessage {
    VoteRequest(VoteRequest),
    VoteResponse(VoteResponse),
    AppendEntries(AppendEntriesRequest),
    AppendEntriesResponse(AppendEntriesResponse),
}

impl RaftMessage {
    /// Term carried by the message, whatever its kind.
    pub fn term(&self) -> Term {
        match self {
            RaftMessage::VoteRequest(m) => m.term,
            RaftMessage::VoteResponse(m) => m.term,
            RaftMessage::AppendEntries(m) => m.term,
            RaftMessage::AppendEntriesResponse(m) => m.term,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RaftMessage::VoteRequest(_) => "vote_request",
            RaftMessage::VoteResponse(_) => "vote_response",
            RaftMessage::AppendEntries(_) => "append_entries",
            RaftMessage::AppendEntriesResponse(_) => "append_entries_response",
        }
    }
}

/// A message addressed from one node to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: NodeId,
    pub to: NodeId,
    pub message: RaftMessage,
}

impl Envelope {
    pub fn new(from: NodeId, to: NodeId, message: RaftMessage) -> Self {
        Self { from, to, message }
    }
}
