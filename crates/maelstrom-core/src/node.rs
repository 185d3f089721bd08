//! # node
//!
//! why: define the raft node state machine and state transitions
//! relations: uses message.rs for rpc types, log.rs for entry management, storage.rs for durability
//! what: NodeState enum, RaftNode (election + replication), PeerView, election/heartbeat timers
//!
//! The node is purely reactive. It never sleeps and never touches the network:
//! the caller feeds it elapsed time through `tick` and inbound messages through
//! `step`, and sends whatever envelopes come back.

use std::collections::{BTreeMap, BTreeSet};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::{
    AppendEntriesRequest, AppendEntriesResponse, ClusterConfig, DurableLog, Envelope, LogEntry,
    LogIndex, NodeId, RaftConfig, RaftError, RaftMessage, RaftResult, Storage, Term, VoteRequest,
    VoteResponse,
};

/// The three possible states a Raft node can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NodeState {
    /// Passive state - listens for heartbeats, votes when asked
    #[default]
    Follower,
    /// Transitional state - requesting votes to become leader
    Candidate,
    /// Active state - manages log replication, sends heartbeats
    Leader,
}

/// Replication progress of one peer, as seen by the leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Next log index to send
    pub next_index: LogIndex,
    /// Highest index known to be replicated on the peer
    pub match_index: LogIndex,
}

/// Leader-only bookkeeping, rebuilt on every election win.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerView {
    progress: BTreeMap<NodeId, Progress>,
}

impl PeerView {
    fn new(peers: impl Iterator<Item = NodeId>, next_index: LogIndex) -> Self {
        let progress = peers
            .map(|id| (id, Progress { next_index, match_index: 0 }))
            .collect();
        Self { progress }
    }

    pub fn get(&self, peer: NodeId) -> Option<&Progress> {
        self.progress.get(&peer)
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Progress)> {
        self.progress.iter().map(|(id, p)| (*id, p))
    }

    fn get_mut(&mut self, peer: NodeId) -> Option<&mut Progress> {
        self.progress.get_mut(&peer)
    }
}

/// Point-in-time summary of a node, cheap to copy around.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub id: NodeId,
    pub state: NodeState,
    pub term: Term,
    pub leader_id: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub last_log_index: LogIndex,
}

/// A single Raft node in the cluster
pub struct RaftNode<S: Storage> {
    id: NodeId,
    cluster: ClusterConfig,
    config: RaftConfig,

    state: NodeState,
    current_term: Term,
    voted_for: Option<NodeId>,
    log: DurableLog<S>,
    commit_index: LogIndex,
    last_applied: LogIndex,

    votes_received: BTreeSet<NodeId>,
    peers: Option<PeerView>,
    leader_id: Option<NodeId>,

    election_elapsed: u64,
    election_timeout: u64,
    heartbeat_elapsed: u64,
    /// ms since the last valid AppendEntries; None until one arrives
    since_leader_contact: Option<u64>,
    rng: StdRng,
    halted: bool,
}

impl<S: Storage> RaftNode<S> {
    /// Create a node with the default timing configuration.
    pub fn new(id: NodeId, cluster: ClusterConfig, storage: S) -> RaftResult<Self> {
        Self::with_config(id, cluster, RaftConfig::default(), storage)
    }

    /// Create a node, restoring term, vote and log from `storage`.
    pub fn with_config(
        id: NodeId,
        cluster: ClusterConfig,
        config: RaftConfig,
        storage: S,
    ) -> RaftResult<Self> {
        config.validate()?;
        if !cluster.contains(id) {
            return Err(RaftError::Config(format!("node {id} is not a cluster member")));
        }
        let hard_state = storage.load_term_and_vote()?;
        let log = DurableLog::open(storage)?;
        let mut rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(id)),
            None => StdRng::from_entropy(),
        };
        let election_timeout = rng.gen_range(config.election_timeout_min..=config.election_timeout_max);

        info!(
            node = id,
            term = hard_state.term,
            voted_for = ?hard_state.voted_for,
            last_index = log.last_index(),
            "raft node starting"
        );

        Ok(Self {
            id,
            cluster,
            config,
            state: NodeState::Follower,
            current_term: hard_state.term,
            voted_for: hard_state.voted_for,
            log,
            commit_index: 0,
            last_applied: 0,
            votes_received: BTreeSet::new(),
            peers: None,
            leader_id: None,
            election_elapsed: 0,
            election_timeout,
            heartbeat_elapsed: 0,
            since_leader_contact: None,
            rng,
            halted: false,
        })
    }

    // ---------------------------------------------------------------------
    // driver entry points
    // ---------------------------------------------------------------------

    /// Advance the node's clocks by `elapsed_ms`.
    ///
    /// Followers and candidates start an election once their randomized
    /// timeout runs out; leaders emit a replication round every heartbeat.
    pub fn tick(&mut self, elapsed_ms: u64) -> RaftResult<Vec<Envelope>> {
        self.ensure_running()?;
        let result = self.tick_inner(elapsed_ms);
        self.guard(result)
    }

    /// Process one inbound message.
    pub fn step(&mut self, from: NodeId, message: RaftMessage) -> RaftResult<Vec<Envelope>> {
        self.ensure_running()?;
        let result = match message {
            RaftMessage::VoteRequest(req) => self.handle_vote_request(from, req),
            RaftMessage::VoteResponse(resp) => self.handle_vote_response(from, resp),
            RaftMessage::AppendEntries(req) => self.handle_append_entries(from, req),
            RaftMessage::AppendEntriesResponse(resp) => self.handle_append_entries_response(from, resp),
        };
        self.guard(result)
    }

    /// Start an election right now, without waiting for the timer.
    /// A leader ignores the request.
    pub fn campaign(&mut self) -> RaftResult<Vec<Envelope>> {
        self.ensure_running()?;
        if self.state == NodeState::Leader {
            return Ok(Vec::new());
        }
        let result = self.start_election();
        self.guard(result)
    }

    /// Append a client command to the leader's log and replicate it.
    ///
    /// Returns the new entry so the caller can wait for its index to commit.
    pub fn propose(&mut self, command: Vec<u8>) -> RaftResult<(LogEntry, Vec<Envelope>)> {
        self.ensure_running()?;
        if self.state != NodeState::Leader {
            return Err(RaftError::NotLeader { leader_hint: self.leader_id });
        }
        let result = self.append_and_replicate(command);
        self.guard(result)
    }

    /// Committed entries not yet handed out, in log order.
    /// Advances `last_applied` to `commit_index`.
    pub fn take_committed(&mut self) -> Vec<LogEntry> {
        if self.last_applied >= self.commit_index {
            return Vec::new();
        }
        let entries = self.log.entries(self.last_applied + 1, self.commit_index).to_vec();
        self.last_applied = self.commit_index;
        entries
    }

    fn tick_inner(&mut self, elapsed_ms: u64) -> RaftResult<Vec<Envelope>> {
        if self.state == NodeState::Leader {
            self.heartbeat_elapsed += elapsed_ms;
            if self.heartbeat_elapsed < self.config.heartbeat_interval {
                return Ok(Vec::new());
            }
            self.heartbeat_elapsed = 0;
            return Ok(self.broadcast_append_entries());
        }

        self.election_elapsed += elapsed_ms;
        if let Some(since) = self.since_leader_contact.as_mut() {
            *since += elapsed_ms;
        }
        if self.election_elapsed >= self.election_timeout {
            debug!(node = self.id, term = self.current_term, "election timeout");
            return self.start_election();
        }
        Ok(Vec::new())
    }

    fn append_and_replicate(&mut self, command: Vec<u8>) -> RaftResult<(LogEntry, Vec<Envelope>)> {
        let entry = LogEntry::new(self.current_term, self.log.last_index() + 1, command);
        self.log.append(std::slice::from_ref(&entry))?;
        debug!(node = self.id, term = self.current_term, index = entry.index, "proposed entry");
        self.maybe_advance_commit();
        Ok((entry, self.broadcast_append_entries()))
    }

    fn ensure_running(&self) -> RaftResult<()> {
        if self.halted {
            return Err(RaftError::Halted);
        }
        Ok(())
    }

    /// Halt the node when `result` carries a durability failure.
    fn guard<T>(&mut self, result: RaftResult<T>) -> RaftResult<T> {
        if let Err(err) = &result {
            if err.is_fatal() && !self.halted {
                error!(node = self.id, term = self.current_term, error = %err, "halting node");
                self.halted = true;
            }
        }
        result
    }

    // ---------------------------------------------------------------------
    // election
    // ---------------------------------------------------------------------

    /// Become a candidate for the next term and ask every peer for a vote.
    ///
    /// The new term and self-vote are persisted before any request leaves.
    fn start_election(&mut self) -> RaftResult<Vec<Envelope>> {
        let term = self.current_term + 1;
        self.persist_hard_state(term, Some(self.id))?;
        self.state = NodeState::Candidate;
        self.leader_id = None;
        self.peers = None;
        self.votes_received.clear();
        self.votes_received.insert(self.id);
        self.reset_election_timer();

        info!(node = self.id, term, "starting election");

        if self.has_quorum() {
            return self.become_leader();
        }

        let (last_log_index, last_log_term) = self.log.last_index_and_term();
        let request = VoteRequest {
            term,
            candidate_id: self.id,
            last_log_index,
            last_log_term,
        };
        Ok(self
            .peer_ids()
            .into_iter()
            .map(|peer| Envelope::new(self.id, peer, RaftMessage::VoteRequest(request.clone())))
            .collect())
    }

    /// Decide whether to grant a vote. Always answers with exactly one envelope,
    /// except when the request comes from an unknown node or is relayed by a
    /// node other than the candidate.
    fn handle_vote_request(&mut self, from: NodeId, req: VoteRequest) -> RaftResult<Vec<Envelope>> {
        if from != req.candidate_id {
            warn!(node = self.id, from, candidate = req.candidate_id, "vote request not sent by its candidate");
            return Ok(Vec::new());
        }
        if !self.cluster.contains(req.candidate_id) {
            warn!(node = self.id, candidate = req.candidate_id, "vote request from unknown node");
            return Ok(Vec::new());
        }

        if req.term > self.current_term && self.leader_is_sticky() {
            debug!(
                node = self.id,
                candidate = req.candidate_id,
                term = req.term,
                "ignoring vote request while leader is live"
            );
            return Ok(vec![self.vote_response(from, false)]);
        }

        if req.term > self.current_term {
            self.become_follower(req.term)?;
        }

        let (last_index, last_term) = self.log.last_index_and_term();
        let up_to_date = (req.last_log_term, req.last_log_index) >= (last_term, last_index);
        let granted = req.term == self.current_term
            && self.voted_for.map_or(true, |v| v == req.candidate_id)
            && up_to_date;

        if granted {
            if self.voted_for != Some(req.candidate_id) {
                self.persist_hard_state(self.current_term, Some(req.candidate_id))?;
            }
            self.reset_election_timer();
            info!(node = self.id, term = self.current_term, candidate = req.candidate_id, "granted vote");
        } else {
            debug!(
                node = self.id,
                term = self.current_term,
                candidate = req.candidate_id,
                voted_for = ?self.voted_for,
                "rejected vote"
            );
        }
        Ok(vec![self.vote_response(from, granted)])
    }

    fn handle_vote_response(&mut self, from: NodeId, resp: VoteResponse) -> RaftResult<Vec<Envelope>> {
        if resp.term > self.current_term {
            self.become_follower(resp.term)?;
            return Ok(Vec::new());
        }
        if self.state != NodeState::Candidate || resp.term != self.current_term || !resp.vote_granted {
            return Ok(Vec::new());
        }
        if !self.cluster.contains(from) {
            return Ok(Vec::new());
        }

        self.votes_received.insert(from);
        debug!(
            node = self.id,
            term = self.current_term,
            votes = self.votes_received.len(),
            quorum = self.quorum_size(),
            "vote received"
        );
        if self.has_quorum() {
            return self.become_leader();
        }
        Ok(Vec::new())
    }

    /// Take over as leader: fresh PeerView, optional no-op, then assert
    /// authority with an immediate replication round.
    fn become_leader(&mut self) -> RaftResult<Vec<Envelope>> {
        self.state = NodeState::Leader;
        self.leader_id = Some(self.id);
        self.votes_received.clear();
        self.heartbeat_elapsed = 0;
        self.since_leader_contact = None;
        self.peers = Some(PeerView::new(self.peer_ids().into_iter(), self.log.last_index() + 1));

        info!(node = self.id, term = self.current_term, last_index = self.log.last_index(), "became leader");

        if self.config.commit_noop {
            let noop = LogEntry::noop(self.current_term, self.log.last_index() + 1);
            self.log.append(std::slice::from_ref(&noop))?;
        }
        self.maybe_advance_commit();
        Ok(self.broadcast_append_entries())
    }

    /// Step down to follower, adopting `term` when it is newer.
    fn become_follower(&mut self, term: Term) -> RaftResult<()> {
        if term > self.current_term {
            self.persist_hard_state(term, None)?;
            self.leader_id = None;
        }
        if self.state != NodeState::Follower {
            info!(node = self.id, term = self.current_term, from = ?self.state, "stepping down to follower");
        }
        self.state = NodeState::Follower;
        self.votes_received.clear();
        self.peers = None;
        self.reset_election_timer();
        Ok(())
    }

    fn leader_is_sticky(&self) -> bool {
        if !self.config.leader_stickiness {
            return false;
        }
        self.state == NodeState::Leader
            || self
                .since_leader_contact
                .is_some_and(|since| since < self.config.election_timeout_min)
    }

    fn vote_response(&self, to: NodeId, vote_granted: bool) -> Envelope {
        Envelope::new(
            self.id,
            to,
            RaftMessage::VoteResponse(VoteResponse { term: self.current_term, vote_granted }),
        )
    }

    // ---------------------------------------------------------------------
    // replication
    // ---------------------------------------------------------------------

    /// Follower side of log replication.
    fn handle_append_entries(
        &mut self,
        from: NodeId,
        req: AppendEntriesRequest,
    ) -> RaftResult<Vec<Envelope>> {
        if req.term < self.current_term {
            debug!(node = self.id, term = self.current_term, stale_term = req.term, leader = req.leader_id, "rejecting stale leader");
            return Ok(vec![self.append_response(from, false, 0, None)]);
        }

        // the acknowledged match index assumes the batch starts right after prev
        let contiguous = req
            .entries
            .iter()
            .zip(req.prev_log_index + 1..)
            .all(|(entry, index)| entry.index == index);
        if !contiguous {
            warn!(
                node = self.id,
                leader = req.leader_id,
                prev_log_index = req.prev_log_index,
                first = req.entries.first().map(|e| e.index),
                "rejecting malformed append entries"
            );
            return Ok(vec![self.append_response(from, false, 0, Some(self.log.last_index()))]);
        }

        if req.term > self.current_term || self.state != NodeState::Follower {
            if self.state == NodeState::Leader && req.term == self.current_term {
                error!(node = self.id, term = req.term, other = req.leader_id, "two leaders in one term");
            }
            self.become_follower(req.term)?;
        }
        self.leader_id = Some(req.leader_id);
        self.election_elapsed = 0;
        self.since_leader_contact = Some(0);

        let conflict_hint = Some(self.log.last_index());
        match self.log.term_at(req.prev_log_index) {
            Some(term) if term == req.prev_log_term => {}
            found => {
                debug!(
                    node = self.id,
                    prev_log_index = req.prev_log_index,
                    prev_log_term = req.prev_log_term,
                    found = ?found,
                    "log consistency check failed"
                );
                return Ok(vec![self.append_response(from, false, 0, conflict_hint)]);
            }
        }

        for entry in &req.entries {
            match self.log.term_at(entry.index) {
                Some(existing) if existing != entry.term => {
                    if entry.index <= self.commit_index {
                        error!(
                            node = self.id,
                            index = entry.index,
                            commit_index = self.commit_index,
                            "leader tried to overwrite a committed entry"
                        );
                        return Ok(vec![self.append_response(from, false, 0, conflict_hint)]);
                    }
                    info!(node = self.id, index = entry.index, existing, incoming = entry.term, "truncating conflicting suffix");
                    self.log.truncate_suffix(entry.index)?;
                    break;
                }
                Some(_) => {}
                None => break,
            }
        }
        self.log.append(&req.entries)?;

        let match_index = req.prev_log_index + req.entries.len() as LogIndex;
        let new_commit = req.leader_commit.min(match_index);
        if new_commit > self.commit_index {
            self.commit_index = new_commit;
            debug!(node = self.id, commit_index = new_commit, "follower commit advanced");
        }
        Ok(vec![self.append_response(from, true, match_index, None)])
    }

    /// Leader side of log replication.
    fn handle_append_entries_response(
        &mut self,
        from: NodeId,
        resp: AppendEntriesResponse,
    ) -> RaftResult<Vec<Envelope>> {
        if resp.term > self.current_term {
            self.become_follower(resp.term)?;
            return Ok(Vec::new());
        }
        if self.state != NodeState::Leader || resp.term != self.current_term {
            return Ok(Vec::new());
        }
        let last_index = self.log.last_index();
        let Some(progress) = self.peers.as_mut().and_then(|p| p.get_mut(from)) else {
            return Ok(Vec::new());
        };

        if resp.success {
            progress.match_index = progress.match_index.max(resp.match_index.min(last_index));
            progress.next_index = progress.next_index.max(progress.match_index + 1);
            let behind = progress.next_index <= last_index;
            self.maybe_advance_commit();
            if behind {
                return Ok(self.create_append_entries(from).into_iter().collect());
            }
        } else {
            let hint = resp.conflict_index.unwrap_or(LogIndex::MAX - 1);
            let next = progress
                .next_index
                .saturating_sub(1)
                .min(hint + 1)
                .max(progress.match_index + 1)
                .max(1);
            debug!(node = self.id, peer = from, next_index = next, "backing off next_index");
            progress.next_index = next;
        }
        Ok(Vec::new())
    }

    /// Build the AppendEntries a leader owes `peer` right now.
    fn create_append_entries(&self, peer: NodeId) -> Option<Envelope> {
        if self.state != NodeState::Leader {
            return None;
        }
        let progress = self.peers.as_ref()?.get(peer)?;
        let prev_log_index = progress.next_index - 1;
        let prev_log_term = self.log.term_at(prev_log_index)?;
        let last = prev_log_index.saturating_add(self.config.max_entries_per_message as LogIndex);
        let entries = self.log.entries(progress.next_index, last).to_vec();
        Some(Envelope::new(
            self.id,
            peer,
            RaftMessage::AppendEntries(AppendEntriesRequest {
                term: self.current_term,
                leader_id: self.id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit: self.commit_index,
            }),
        ))
    }

    /// One AppendEntries per peer (heartbeat when it has nothing new).
    fn broadcast_append_entries(&self) -> Vec<Envelope> {
        self.peer_ids()
            .into_iter()
            .filter_map(|peer| self.create_append_entries(peer))
            .collect()
    }

    /// Raise commit_index to the highest current-term index held by a majority.
    /// Returns true when it moved.
    fn maybe_advance_commit(&mut self) -> bool {
        if self.state != NodeState::Leader {
            return false;
        }
        let quorum = self.quorum_size();
        let mut candidate = self.log.last_index();
        while candidate > self.commit_index {
            match self.log.term_at(candidate) {
                Some(term) if term == self.current_term => {}
                // older terms only commit underneath a current-term entry
                _ => break,
            }
            let replicas = 1 + self
                .peers
                .as_ref()
                .map_or(0, |p| p.iter().filter(|(_, pr)| pr.match_index >= candidate).count());
            if replicas >= quorum {
                info!(node = self.id, term = self.current_term, commit_index = candidate, "commit advanced");
                self.commit_index = candidate;
                return true;
            }
            candidate -= 1;
        }
        false
    }

    fn append_response(
        &self,
        to: NodeId,
        success: bool,
        match_index: LogIndex,
        conflict_index: Option<LogIndex>,
    ) -> Envelope {
        Envelope::new(
            self.id,
            to,
            RaftMessage::AppendEntriesResponse(AppendEntriesResponse {
                term: self.current_term,
                success,
                match_index,
                conflict_index,
            }),
        )
    }

    // ---------------------------------------------------------------------
    // helpers
    // ---------------------------------------------------------------------

    fn persist_hard_state(&mut self, term: Term, voted_for: Option<NodeId>) -> RaftResult<()> {
        self.log.storage_mut().save_term_and_vote(term, voted_for)?;
        self.current_term = term;
        self.voted_for = voted_for;
        Ok(())
    }

    fn reset_election_timer(&mut self) {
        self.election_elapsed = 0;
        self.election_timeout = self
            .rng
            .gen_range(self.config.election_timeout_min..=self.config.election_timeout_max);
    }

    fn peer_ids(&self) -> Vec<NodeId> {
        self.cluster.peers_of(self.id).map(|(id, _)| id).collect()
    }

    /// Majority of the full cluster: floor(N/2)+1
    pub fn quorum_size(&self) -> usize {
        self.cluster.quorum_size()
    }

    /// Whether the votes collected so far form a majority.
    pub fn has_quorum(&self) -> bool {
        self.votes_received.len() >= self.quorum_size()
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            id: self.id,
            state: self.state,
            term: self.current_term,
            leader_id: self.leader_id,
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            last_log_index: self.log.last_index(),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn is_leader(&self) -> bool {
        self.state == NodeState::Leader
    }

    pub fn current_term(&self) -> Term {
        self.current_term
    }

    pub fn voted_for(&self) -> Option<NodeId> {
        self.voted_for
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        self.leader_id
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    pub fn log(&self) -> &DurableLog<S> {
        &self.log
    }

    pub fn votes_received(&self) -> &BTreeSet<NodeId> {
        &self.votes_received
    }

    pub fn peers(&self) -> Option<&PeerView> {
        self.peers.as_ref()
    }

    pub fn cluster(&self) -> &ClusterConfig {
        &self.cluster
    }

    pub fn config(&self) -> &RaftConfig {
        &self.config
    }

    pub fn election_timeout(&self) -> u64 {
        self.election_timeout
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }
}
