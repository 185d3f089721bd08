//! # cli
//!
//! why: one binary both runs a node and talks to a running cluster
//! relations: parsed by bin/maelstromdb.rs; ServeArgs builds a ServerConfig from config.rs
//! what: Cli, Command (serve, write, delete, query, status), argument structs

use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint};

use crate::config::{parse_peer, ServerConfig};
use crate::ConfigError;

#[derive(Parser, Debug)]
#[command(author, version, about = "Raft-replicated key-value store", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a node until ctrl-c.
    Serve(ServeArgs),
    /// Store a value under a key.
    Write(WriteArgs),
    /// Remove a key.
    Delete(KeyArgs),
    /// Read a key.
    Query(QueryArgs),
    /// Show every node's role, term and commit index.
    Status(ClusterArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// JSON config file; flags below override its values
    #[arg(long, value_hint = ValueHint::FilePath)]
    pub config: Option<PathBuf>,

    /// Numeric node id (must appear among the peers)
    #[arg(long)]
    pub id: Option<u64>,

    /// Address to accept peer and client connections on, e.g. 127.0.0.1:7101
    #[arg(long, value_hint = ValueHint::Hostname)]
    pub listen: Option<String>,

    /// Cluster member as id=addr; repeat or comma-separate, include this node
    #[arg(long, value_delimiter = ',')]
    pub peer: Vec<String>,

    /// Directory for the log pages and metadata
    #[arg(long, value_hint = ValueHint::DirPath)]
    pub data_dir: Option<PathBuf>,
}

impl ServeArgs {
    /// Build the node config from the file (if any) with flags applied on top.
    pub fn into_config(self) -> Result<ServerConfig, ConfigError> {
        let peers = self
            .peer
            .iter()
            .map(|spec| parse_peer(spec))
            .collect::<Result<BTreeMap<_, _>, _>>()?;

        let mut config = match (self.config, self.id) {
            (Some(path), _) => ServerConfig::load(&path)?,
            (None, Some(id)) => ServerConfig::new(id, peers.clone()),
            (None, None) => {
                return Err(ConfigError::Invalid("either --config or --id is required".to_string()))
            }
        };

        if let Some(id) = self.id {
            config.node_id = id;
        }
        if !peers.is_empty() {
            config.peers = peers;
        }
        match self.listen {
            Some(listen) => config.listen = listen,
            None if config.listen.is_empty() => {
                config.listen = config.peers.get(&config.node_id).cloned().unwrap_or_default();
            }
            None => {}
        }
        if let Some(dir) = self.data_dir {
            config.data_dir = Some(dir);
        }
        config.validate()?;
        Ok(config)
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClusterArgs {
    /// Comma-separated node addresses to try
    #[arg(long, value_delimiter = ',', required = true)]
    pub cluster: Vec<String>,

    /// Give up on a node after this many milliseconds
    #[arg(long, default_value_t = 5000)]
    pub timeout_ms: u64,
}

#[derive(Args, Debug, Clone)]
pub struct WriteArgs {
    #[command(flatten)]
    pub cluster: ClusterArgs,
    pub key: String,
    pub value: String,
}

#[derive(Args, Debug, Clone)]
pub struct KeyArgs {
    #[command(flatten)]
    pub cluster: ClusterArgs,
    pub key: String,
}

#[derive(Args, Debug, Clone)]
pub struct QueryArgs {
    #[command(flatten)]
    pub cluster: ClusterArgs,
    /// Answer from the first reachable node without going through the leader
    #[arg(long)]
    pub stale: bool,
    pub key: String,
}
