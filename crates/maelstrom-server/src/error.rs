//! # error
//!
//! why: tell a client exactly why its request did not complete, and whether retrying elsewhere helps
//! relations: produced by coordinator.rs, runtime.rs and client.rs; config.rs owns ConfigError
//! what: ClientError, ConfigError

use std::path::PathBuf;

use maelstrom_core::NodeId;
use thiserror::Error;

/// Failures visible to whoever submitted a request.
#[derive(Debug, Error)]
pub enum ClientError {
    /// This node cannot accept writes. `leader_addr` is filled in when the
    /// node knows who the leader is.
    #[error("not the leader (leader hint: {leader_hint:?})")]
    NotLeader {
        leader_hint: Option<NodeId>,
        leader_addr: Option<String>,
    },

    /// The entry was appended but leadership changed before it committed.
    /// It may or may not survive; the client has to retry against the new leader.
    #[error("lost leadership before the request committed")]
    LostLeadership,

    #[error("request timed out")]
    Timeout,

    #[error("node unavailable: {0}")]
    Unavailable(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl ClientError {
    /// Whether the same request might succeed on another node.
    pub fn is_redirect(&self) -> bool {
        matches!(
            self,
            ClientError::NotLeader { .. } | ClientError::Unavailable(_) | ClientError::Io(_)
        )
    }
}

/// Problems with a node's configuration file or flags.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
