//! # support
//!
//! why: drive several raft nodes deterministically without sockets or sleeps
//! relations: shared by the integration tests of maelstrom-core
//! what: Cluster harness (logical clock, message routing, link blocking, lossy delivery, crash/restart,
//!       the five raft safety properties checked after every step)

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use maelstrom_core::{
    ClusterConfig, Command, CommandOutput, Envelope, InMemoryStorage, KvStore, LogEntry, LogIndex,
    NodeId, NodeState, RaftConfig, RaftNode, RaftResult, Term,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Ms of logical time each harness tick advances.
pub const TICK_MS: u64 = 10;

pub fn cluster_config(n: u64) -> ClusterConfig {
    ClusterConfig::new((1..=n).map(|id| (id, format!("127.0.0.1:{}", 7100 + id))).collect())
        .expect("non-empty cluster")
}

pub fn raft_config(seed: u64) -> RaftConfig {
    RaftConfig {
        rng_seed: Some(seed),
        ..RaftConfig::default()
    }
}

/// Misbehaviour of the network once `Cluster::set_faults` is called.
#[derive(Debug, Clone, Copy)]
pub struct Faults {
    /// Chance that a message is lost
    pub drop_rate: f64,
    /// Chance that a message arrives twice
    pub duplicate_rate: f64,
    /// Each copy arrives after 1..=max_delay_ms, so later sends can overtake earlier ones
    pub max_delay_ms: u64,
}

struct InFlight {
    deliver_at: u64,
    envelope: Envelope,
}

/// A whole cluster in one process. The network is perfect and instant until
/// tests cut links or turn on faults.
pub struct Cluster {
    cluster: ClusterConfig,
    config: RaftConfig,
    nodes: BTreeMap<NodeId, RaftNode<InMemoryStorage>>,
    storages: BTreeMap<NodeId, InMemoryStorage>,
    stores: BTreeMap<NodeId, KvStore>,
    outputs: BTreeMap<NodeId, BTreeMap<LogIndex, CommandOutput>>,
    down: BTreeSet<NodeId>,
    blocked: BTreeSet<(NodeId, NodeId)>,
    faults: Option<Faults>,
    in_flight: Vec<InFlight>,
    rng: StdRng,
    /// first entry applied at each index, with the applying node's term at the time
    committed: BTreeMap<LogIndex, (LogEntry, Term)>,
    leaders: BTreeMap<Term, NodeId>,
    /// log of every current leader as of its last step, for the append-only check
    leader_logs: BTreeMap<NodeId, (Term, Vec<LogEntry>)>,
    pub elapsed_ms: u64,
}

impl Cluster {
    pub fn new(n: u64, seed: u64) -> Self {
        let storages = (1..=n).map(|id| (id, InMemoryStorage::new())).collect();
        Self::with_storages(storages, raft_config(seed))
    }

    /// Build a cluster on top of pre-populated storages, one per member.
    pub fn with_storages(storages: BTreeMap<NodeId, InMemoryStorage>, config: RaftConfig) -> Self {
        let cluster = cluster_config(storages.len() as u64);
        let rng = StdRng::seed_from_u64(config.rng_seed.unwrap_or_default());
        let mut harness = Self {
            cluster,
            config,
            nodes: BTreeMap::new(),
            storages,
            stores: BTreeMap::new(),
            outputs: BTreeMap::new(),
            down: BTreeSet::new(),
            blocked: BTreeSet::new(),
            faults: None,
            in_flight: Vec::new(),
            rng,
            committed: BTreeMap::new(),
            leaders: BTreeMap::new(),
            leader_logs: BTreeMap::new(),
            elapsed_ms: 0,
        };
        let ids: Vec<NodeId> = harness.storages.keys().copied().collect();
        for id in ids {
            harness.boot(id);
        }
        harness
    }

    fn boot(&mut self, id: NodeId) {
        let storage = self.storages[&id].clone();
        let node = RaftNode::with_config(id, self.cluster.clone(), self.config.clone(), storage)
            .expect("node boots");
        self.nodes.insert(id, node);
        self.stores.insert(id, KvStore::new());
        self.outputs.insert(id, BTreeMap::new());
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    pub fn node(&self, id: NodeId) -> &RaftNode<InMemoryStorage> {
        &self.nodes[&id]
    }

    pub fn store(&self, id: NodeId) -> &KvStore {
        &self.stores[&id]
    }

    pub fn output(&self, id: NodeId, index: LogIndex) -> Option<&CommandOutput> {
        self.outputs[&id].get(&index)
    }

    pub fn storage(&self, id: NodeId) -> &InMemoryStorage {
        &self.storages[&id]
    }

    // ------------------------------------------------------------------
    // time and delivery
    // ------------------------------------------------------------------

    /// Advance every live node by one tick, delivering all traffic each
    /// node's tick produces before the next node ticks. With faults on,
    /// traffic is delivered on the tick it falls due instead.
    pub fn tick(&mut self) {
        self.elapsed_ms += TICK_MS;
        self.deliver_due();
        for id in self.ids() {
            if self.down.contains(&id) {
                continue;
            }
            let out = self.nodes.get_mut(&id).expect("node").tick(TICK_MS).expect("tick");
            self.after_step(id);
            self.deliver(out);
        }
    }

    pub fn run_for(&mut self, ms: u64) {
        let target = self.elapsed_ms + ms;
        while self.elapsed_ms < target {
            self.tick();
        }
    }

    /// Tick until `done` holds, or give up after `max_ms`.
    pub fn run_until(&mut self, max_ms: u64, mut done: impl FnMut(&Cluster) -> bool) -> bool {
        let deadline = self.elapsed_ms + max_ms;
        while self.elapsed_ms < deadline {
            if done(self) {
                return true;
            }
            self.tick();
        }
        done(self)
    }

    /// Route messages until the network is quiet, or hand them to the
    /// lossy network when faults are on.
    pub fn deliver(&mut self, envelopes: Vec<Envelope>) {
        if let Some(faults) = self.faults {
            self.send_lossy(faults, envelopes);
            return;
        }
        let mut queue: VecDeque<Envelope> = envelopes.into();
        while let Some(envelope) = queue.pop_front() {
            queue.extend(self.receive(envelope));
        }
    }

    fn send_lossy(&mut self, faults: Faults, envelopes: Vec<Envelope>) {
        for envelope in envelopes {
            if self.rng.gen_bool(faults.drop_rate) {
                continue;
            }
            let copies = if self.rng.gen_bool(faults.duplicate_rate) { 2 } else { 1 };
            for _ in 0..copies {
                let deliver_at = self.elapsed_ms + self.rng.gen_range(1..=faults.max_delay_ms.max(1));
                self.in_flight.push(InFlight { deliver_at, envelope: envelope.clone() });
            }
        }
    }

    /// Deliver every in-flight message whose time has come, earliest first.
    fn deliver_due(&mut self) {
        let now = self.elapsed_ms;
        let (mut due, later): (Vec<InFlight>, Vec<InFlight>) =
            std::mem::take(&mut self.in_flight).into_iter().partition(|m| m.deliver_at <= now);
        self.in_flight = later;
        due.sort_by_key(|m| m.deliver_at);
        for message in due {
            let out = self.receive(message.envelope);
            self.deliver(out);
        }
    }

    /// Hand one message to its destination, if the link is up.
    fn receive(&mut self, envelope: Envelope) -> Vec<Envelope> {
        if !self.link_up(envelope.from, envelope.to) {
            return Vec::new();
        }
        let to = envelope.to;
        let out = self
            .nodes
            .get_mut(&to)
            .expect("known node")
            .step(envelope.from, envelope.message)
            .expect("step");
        self.after_step(to);
        out
    }

    fn link_up(&self, from: NodeId, to: NodeId) -> bool {
        !self.down.contains(&from) && !self.down.contains(&to) && !self.blocked.contains(&(from, to))
    }

    // ------------------------------------------------------------------
    // safety checks
    // ------------------------------------------------------------------

    /// Apply newly committed entries and check safety after `id` changed.
    fn after_step(&mut self, id: NodeId) {
        self.check_election_safety(id);
        self.check_leader_append_only(id);
        self.apply_committed(id);
        self.check_log_matching(id);
        self.check_leader_completeness(id);
    }

    /// At most one leader per term.
    fn check_election_safety(&mut self, id: NodeId) {
        let node = &self.nodes[&id];
        if node.state() == NodeState::Leader {
            let term = node.current_term();
            if let Some(other) = self.leaders.insert(term, id) {
                assert_eq!(other, id, "two leaders elected in term {term}");
            }
        }
    }

    /// A leader never overwrites or deletes entries in its own log.
    fn check_leader_append_only(&mut self, id: NodeId) {
        let node = &self.nodes[&id];
        if !node.is_leader() {
            self.leader_logs.remove(&id);
            return;
        }
        let term = node.current_term();
        let log = node.log().entries(1, node.log().last_index());
        let same_term = self.leader_logs.get(&id).is_some_and(|(seen_term, _)| *seen_term == term);
        if !same_term {
            self.leader_logs.insert(id, (term, log.to_vec()));
            return;
        }
        if let Some((_, seen)) = self.leader_logs.get_mut(&id) {
            assert!(
                log.len() >= seen.len() && log[..seen.len()] == seen[..],
                "leader {id} rewrote its own log in term {term}"
            );
            seen.extend_from_slice(&log[seen.len()..]);
        }
    }

    /// Feed committed entries to the node's state machine; no two nodes may
    /// ever apply different entries at the same index.
    fn apply_committed(&mut self, id: NodeId) {
        let node = self.nodes.get_mut(&id).expect("node");
        let term = node.current_term();
        for entry in node.take_committed() {
            match self.committed.get(&entry.index) {
                Some((first, _)) => assert_eq!(
                    first, &entry,
                    "node {id} applied a different entry at index {}",
                    entry.index
                ),
                None => {
                    self.committed.insert(entry.index, (entry.clone(), term));
                }
            }
            let output = self.stores.get_mut(&id).expect("store").apply(&entry);
            self.outputs.get_mut(&id).expect("outputs").insert(entry.index, output);
        }
    }

    /// Two logs holding the same (index, term) are identical up to that index.
    fn check_log_matching(&self, id: NodeId) {
        let mine = self.nodes[&id].log();
        for (other_id, other) in &self.nodes {
            if *other_id == id {
                continue;
            }
            let theirs = other.log();
            let upto = mine.last_index().min(theirs.last_index());
            let Some(shared) = (1..=upto).rev().find(|i| mine.term_at(*i) == theirs.term_at(*i)) else {
                continue;
            };
            assert!(
                mine.entries(1, shared) == theirs.entries(1, shared),
                "nodes {id} and {other_id} agree on index {shared} but not on what precedes it"
            );
        }
    }

    /// A leader holds every entry committed in an earlier or equal term.
    ///
    /// The term recorded with a committed entry is the applying node's term,
    /// which is never below the term the entry was committed in, so stale
    /// leaders from before the commit are not held to it.
    fn check_leader_completeness(&self, id: NodeId) {
        let node = &self.nodes[&id];
        if !node.is_leader() {
            return;
        }
        let term = node.current_term();
        for (index, (entry, seen_in)) in &self.committed {
            if *seen_in <= term {
                assert_eq!(
                    node.log().entry_at(*index),
                    Some(entry),
                    "leader {id} of term {term} is missing committed index {index}"
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // client side
    // ------------------------------------------------------------------

    /// Propose on `id` and deliver the resulting traffic.
    pub fn propose(&mut self, id: NodeId, command: &Command) -> RaftResult<LogIndex> {
        let payload = command.encode()?;
        let (entry, out) = self.nodes.get_mut(&id).expect("node").propose(payload)?;
        self.after_step(id);
        self.deliver(out);
        Ok(entry.index)
    }

    pub fn campaign(&mut self, id: NodeId) {
        let out = self.nodes.get_mut(&id).expect("node").campaign().expect("campaign");
        self.after_step(id);
        self.deliver(out);
    }

    // ------------------------------------------------------------------
    // observation
    // ------------------------------------------------------------------

    /// Live leaders, whatever their term.
    pub fn leaders(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|(id, node)| !self.down.contains(*id) && node.is_leader())
            .map(|(id, _)| *id)
            .collect()
    }

    /// The live leader with the highest term.
    pub fn leader(&self) -> Option<NodeId> {
        self.leaders()
            .into_iter()
            .max_by_key(|id| self.nodes[id].current_term())
    }

    pub fn wait_for_leader(&mut self, max_ms: u64) -> NodeId {
        assert!(self.run_until(max_ms, |c| c.leader().is_some()), "no leader elected");
        self.leader().expect("leader")
    }

    pub fn elected_leaders(&self) -> &BTreeMap<Term, NodeId> {
        &self.leaders
    }

    /// Highest index applied anywhere so far.
    pub fn highest_committed(&self) -> LogIndex {
        self.committed.keys().next_back().copied().unwrap_or(0)
    }

    // ------------------------------------------------------------------
    // faults
    // ------------------------------------------------------------------

    /// Drop messages travelling from `from` to `to`.
    pub fn block(&mut self, from: NodeId, to: NodeId) {
        self.blocked.insert((from, to));
    }

    pub fn block_both(&mut self, a: NodeId, b: NodeId) {
        self.block(a, b);
        self.block(b, a);
    }

    /// Split the cluster into groups that can only talk among themselves.
    pub fn partition(&mut self, groups: &[&[NodeId]]) {
        self.heal();
        for (i, left) in groups.iter().enumerate() {
            for right in groups.iter().skip(i + 1) {
                for a in left.iter() {
                    for b in right.iter() {
                        self.block_both(*a, *b);
                    }
                }
            }
        }
    }

    pub fn heal(&mut self) {
        self.blocked.clear();
    }

    /// Make every later send lossy, duplicated and delayed.
    pub fn set_faults(&mut self, faults: Faults) {
        self.faults = Some(faults);
    }

    /// Back to instant, reliable sends; messages already in flight still arrive.
    pub fn clear_faults(&mut self) {
        self.faults = None;
    }

    /// Stop a node; its volatile state is lost, its storage is kept.
    pub fn crash(&mut self, id: NodeId) {
        self.down.insert(id);
    }

    /// Start a crashed node again from what it persisted.
    pub fn restart(&mut self, id: NodeId) {
        self.down.remove(&id);
        self.boot(id);
    }
}
