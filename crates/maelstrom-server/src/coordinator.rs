//! # coordinator
//!
//! why: connect a client waiting on a write to the moment its log entry is applied
//! relations: owned by the Worker in runtime.rs; proposes through RaftNode, answers through oneshot channels
//! what: RequestCoordinator (submit, on_applied, fail_all), Committed

use std::collections::BTreeMap;

use maelstrom_core::{
    Command, CommandOutput, Envelope, KvStore, LogEntry, LogIndex, RaftError, RaftNode,
    RaftResult, Storage, Term,
};
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::ClientError;

/// Result of a command that made it through the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committed {
    pub output: CommandOutput,
    /// Log index the command was applied at (for stale reads, the last applied index)
    pub index: LogIndex,
}

pub type Reply = oneshot::Sender<Result<Committed, ClientError>>;

struct Pending {
    term: Term,
    reply: Reply,
}

/// Client requests appended by this node and not yet applied.
///
/// Requests are keyed by the index they were appended at. Whatever ends up
/// applied at that index answers the request: the command's own output if the
/// entry still carries the term it was proposed in, `LostLeadership` if another
/// leader's entry replaced it.
#[derive(Default)]
pub struct RequestCoordinator {
    pending: BTreeMap<LogIndex, Pending>,
}

impl RequestCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `command` to the leader's log and park `reply` until it is applied.
    ///
    /// A follower or candidate answers `NotLeader` right away. The returned
    /// envelopes carry the new entry to the followers.
    pub fn submit<S: Storage>(
        &mut self,
        node: &mut RaftNode<S>,
        command: &Command,
        reply: Reply,
    ) -> RaftResult<Vec<Envelope>> {
        let payload = match command.encode() {
            Ok(payload) => payload,
            Err(err) => {
                let _ = reply.send(Err(ClientError::Protocol(err.to_string())));
                return Ok(Vec::new());
            }
        };
        match node.propose(payload) {
            Ok((entry, envelopes)) => {
                debug!(node = node.id(), index = entry.index, term = entry.term, key = command.key(), "request accepted");
                self.pending.insert(entry.index, Pending { term: entry.term, reply });
                Ok(envelopes)
            }
            Err(RaftError::NotLeader { leader_hint }) => {
                let leader_addr = leader_hint
                    .and_then(|id| node.cluster().address(id))
                    .map(str::to_string);
                let _ = reply.send(Err(ClientError::NotLeader { leader_hint, leader_addr }));
                Ok(Vec::new())
            }
            Err(err) => {
                let _ = reply.send(Err(ClientError::Unavailable(err.to_string())));
                Err(err)
            }
        }
    }

    /// Answer the request parked at `entry.index`, if any.
    pub fn on_applied(&mut self, entry: &LogEntry, output: CommandOutput) {
        let Some(pending) = self.pending.remove(&entry.index) else {
            return;
        };
        let result = if pending.term == entry.term {
            Ok(Committed { output, index: entry.index })
        } else {
            info!(index = entry.index, proposed = pending.term, applied = entry.term, "request overwritten by another leader");
            Err(ClientError::LostLeadership)
        };
        let _ = pending.reply.send(result);
    }

    /// Fail every parked request; called when this node stops being leader.
    pub fn fail_all(&mut self) {
        self.fail_all_with(|| ClientError::LostLeadership);
    }

    pub fn fail_all_with(&mut self, error: impl Fn() -> ClientError) {
        if self.pending.is_empty() {
            return;
        }
        info!(count = self.pending.len(), "failing pending requests");
        for (_, pending) in std::mem::take(&mut self.pending) {
            let _ = pending.reply.send(Err(error()));
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Serve a read from the local state machine without consulting anyone.
pub fn read_stale(store: &KvStore, key: &str) -> Committed {
    Committed {
        output: CommandOutput::Value(store.get(key).map(str::to_string)),
        index: store.last_applied(),
    }
}
