//! # maelstrom-server
//!
//! why: run maelstrom-core nodes as real processes that talk to each other and to clients
//! relations: drives maelstrom-core's RaftNode, persists through maelstrom-storage
//! what: decision loop (runtime), request coordinator, transports, wire protocol, leader proxy, config
//!
//! - [`runtime`] owns one `RaftNode` per task and is the only place its state changes.
//! - [`coordinator`] parks client requests until their log index is applied.
//! - [`transport`] moves envelopes between nodes, over TCP or in-process.
//! - [`server`] accepts peer and client connections on one listener.
//! - [`client`] finds the leader by following redirect hints.
//! - [`protocol`] is the newline-delimited JSON framing shared by all of the above.

pub mod cli;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod protocol;
pub mod runtime;
pub mod server;
pub mod transport;

pub use client::LeaderProxy;
pub use config::ServerConfig;
pub use coordinator::{Committed, RequestCoordinator};
pub use error::{ClientError, ConfigError};
pub use protocol::{ClientReply, ClientRequest, Frame, ReadMode};
pub use runtime::{spawn_node, NodeHandle, NodeOptions};
pub use server::Server;
pub use transport::{LocalNetwork, LocalTransport, TcpTransport, Transport};
