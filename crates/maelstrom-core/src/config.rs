//! # config
//!
//! why: keep cluster size and timing as inputs instead of constants baked into the engine
//! relations: consumed by node.rs, built from the server's json config file
//! what: RaftConfig (timers, batching, optional behaviours), ClusterConfig (static peer table)

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{NodeId, RaftError, RaftResult};

/// Timing and behaviour knobs for a single node. All durations are milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// Lower bound of the randomized election timeout
    pub election_timeout_min: u64,
    /// Upper bound of the randomized election timeout
    pub election_timeout_max: u64,
    /// How often a leader replicates to every peer
    pub heartbeat_interval: u64,
    /// Cap on entries carried by one AppendEntries message
    pub max_entries_per_message: usize,
    /// Append an empty entry on winning an election so earlier terms commit promptly
    pub commit_noop: bool,
    /// Refuse votes while a live leader has been heard from recently
    pub leader_stickiness: bool,
    /// Seed for election jitter; random when absent
    pub rng_seed: Option<u64>,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: 150,
            election_timeout_max: 300,
            heartbeat_interval: 50,
            max_entries_per_message: 64,
            commit_noop: true,
            leader_stickiness: false,
            rng_seed: None,
        }
    }
}

impl RaftConfig {
    pub fn validate(&self) -> RaftResult<()> {
        if self.election_timeout_min == 0 || self.election_timeout_min > self.election_timeout_max {
            return Err(RaftError::Config(format!(
                "election timeout range {}..={} is empty",
                self.election_timeout_min, self.election_timeout_max
            )));
        }
        if self.heartbeat_interval == 0 || self.heartbeat_interval >= self.election_timeout_min {
            return Err(RaftError::Config(format!(
                "heartbeat interval {} must be non-zero and shorter than the minimum election timeout {}",
                self.heartbeat_interval, self.election_timeout_min
            )));
        }
        if self.max_entries_per_message == 0 {
            return Err(RaftError::Config(
                "max_entries_per_message must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Fixed membership of the cluster: node id -> network address.
///
/// Nodes never hold references into each other; everything is addressed by id
/// through this table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    members: BTreeMap<NodeId, String>,
}

impl ClusterConfig {
    pub fn new(members: BTreeMap<NodeId, String>) -> RaftResult<Self> {
        if members.is_empty() {
            return Err(RaftError::Config("cluster needs at least one member".to_string()));
        }
        Ok(Self { members })
    }

    /// Ids of every member, ascending.
    pub fn ids(&self) -> Vec<NodeId> {
        self.members.keys().copied().collect()
    }

    /// Every member except `id`.
    pub fn peers_of(&self, id: NodeId) -> impl Iterator<Item = (NodeId, &str)> + '_ {
        self.members
            .iter()
            .filter(move |(member, _)| **member != id)
            .map(|(member, addr)| (*member, addr.as_str()))
    }

    pub fn address(&self, id: NodeId) -> Option<&str> {
        self.members.get(&id).map(String::as_str)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.members.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// floor(N/2)+1
    pub fn quorum_size(&self) -> usize {
        self.members.len() / 2 + 1
    }
}
