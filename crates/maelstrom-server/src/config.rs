//! # config
//!
//! why: describe one node of a cluster in a file an operator can edit
//! relations: read by the maelstromdb binary, turned into NodeOptions for runtime.rs
//! what: ServerConfig (json), peer flag parsing, validation

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use maelstrom_core::{ClusterConfig, NodeId, RaftConfig};
use maelstrom_storage::DEFAULT_MAX_PAGE_BYTES;
use serde::{Deserialize, Serialize};

use crate::runtime::NodeOptions;
use crate::ConfigError;

fn default_tick_interval_ms() -> u64 {
    10
}

fn default_request_timeout_ms() -> u64 {
    5000
}

fn default_max_page_bytes() -> u64 {
    DEFAULT_MAX_PAGE_BYTES
}

/// Everything needed to start one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub node_id: NodeId,
    /// Address the node accepts peer and client connections on
    pub listen: String,
    /// Directory for this node's log pages and metadata; `data/<node_id>` when absent
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    /// Every cluster member, this node included
    pub peers: BTreeMap<NodeId, String>,
    #[serde(default)]
    pub raft: RaftConfig,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_max_page_bytes")]
    pub max_page_bytes: u64,
}

impl ServerConfig {
    /// Minimal config for `node_id`, listening on its own peer address.
    pub fn new(node_id: NodeId, peers: BTreeMap<NodeId, String>) -> Self {
        let listen = peers.get(&node_id).cloned().unwrap_or_default();
        Self {
            node_id,
            listen,
            data_dir: None,
            peers,
            raft: RaftConfig::default(),
            tick_interval_ms: default_tick_interval_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            max_page_bytes: default_max_page_bytes(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&contents)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.peers.is_empty() {
            return Err(ConfigError::Invalid("peers must list at least this node".to_string()));
        }
        if !self.peers.contains_key(&self.node_id) {
            return Err(ConfigError::Invalid(format!(
                "node id {} missing from peers",
                self.node_id
            )));
        }
        if self.listen.is_empty() {
            return Err(ConfigError::Invalid("listen address is empty".to_string()));
        }
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid("tick_interval_ms must be non-zero".to_string()));
        }
        if self.tick_interval_ms >= self.raft.heartbeat_interval {
            return Err(ConfigError::Invalid(format!(
                "tick interval {}ms must be shorter than the heartbeat interval {}ms",
                self.tick_interval_ms, self.raft.heartbeat_interval
            )));
        }
        self.raft
            .validate()
            .map_err(|err| ConfigError::Invalid(err.to_string()))
    }

    pub fn cluster(&self) -> Result<ClusterConfig, ConfigError> {
        ClusterConfig::new(self.peers.clone()).map_err(|err| ConfigError::Invalid(err.to_string()))
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("data").join(self.node_id.to_string()))
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn node_options(&self) -> Result<NodeOptions, ConfigError> {
        Ok(NodeOptions {
            id: self.node_id,
            cluster: self.cluster()?,
            raft: self.raft.clone(),
            tick_interval: self.tick_interval(),
            request_timeout: self.request_timeout(),
        })
    }
}

/// Parse an `id=addr` pair as given to `--peer`.
pub fn parse_peer(spec: &str) -> Result<(NodeId, String), ConfigError> {
    let (id, addr) = spec
        .split_once('=')
        .ok_or_else(|| ConfigError::Invalid(format!("peer `{spec}` is not of the form id=addr")))?;
    let id = id
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("peer id `{id}` is not a number")))?;
    let addr = addr.trim();
    if addr.is_empty() {
        return Err(ConfigError::Invalid(format!("peer {id} has an empty address")));
    }
    Ok((id, addr.to_string()))
}
