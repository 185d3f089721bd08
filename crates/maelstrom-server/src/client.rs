//! # client
//!
//! why: let a client talk to "the cluster" without knowing which node leads
//! relations: speaks protocol.rs frames to server.rs; used by the maelstromdb binary and tcp tests
//! what: LeaderProxy (redirect-following request loop)

use std::time::Duration;

use maelstrom_core::{Command, CommandOutput, NodeStatus};
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::debug;

use crate::coordinator::Committed;
use crate::protocol::{read_frame, write_frame, ClientReply, ClientRequest, Frame, ReadMode};
use crate::ClientError;

/// Pause before retrying when nobody knows the leader (an election is running).
const ELECTION_BACKOFF: Duration = Duration::from_millis(100);

/// Sends requests to whichever node currently leads.
///
/// Starts with the last node that answered (or the first address), follows
/// `NotLeader` hints, and moves on to the next address when a node is
/// unreachable or does not know the leader.
pub struct LeaderProxy {
    addrs: Vec<String>,
    current: usize,
    request_timeout: Duration,
    max_attempts: usize,
    next_id: u64,
}

impl LeaderProxy {
    pub fn new(addrs: Vec<String>) -> Self {
        let max_attempts = (addrs.len() * 4).max(4);
        Self {
            addrs,
            current: 0,
            request_timeout: Duration::from_secs(5),
            max_attempts,
            next_id: 1,
        }
    }

    pub fn with_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    /// Address the next request goes to first.
    pub fn current_addr(&self) -> Option<&str> {
        self.addrs.get(self.current).map(String::as_str)
    }

    pub async fn put(&mut self, key: impl Into<String>, value: impl Into<String>) -> Result<Committed, ClientError> {
        self.submit(Command::put(key, value), ReadMode::Linearizable).await
    }

    pub async fn delete(&mut self, key: impl Into<String>) -> Result<bool, ClientError> {
        match self.submit(Command::delete(key), ReadMode::Linearizable).await?.output {
            CommandOutput::Deleted { existed } => Ok(existed),
            other => Err(ClientError::Protocol(format!("unexpected output {other:?}"))),
        }
    }

    pub async fn get(&mut self, key: impl Into<String>, read_mode: ReadMode) -> Result<Option<String>, ClientError> {
        match self.submit(Command::get(key), read_mode).await?.output {
            CommandOutput::Value(value) => Ok(value),
            other => Err(ClientError::Protocol(format!("unexpected output {other:?}"))),
        }
    }

    /// Submit a command, hopping between nodes until one accepts it.
    ///
    /// Stale reads are answered by the first reachable node.
    pub async fn submit(&mut self, command: Command, read_mode: ReadMode) -> Result<Committed, ClientError> {
        if self.addrs.is_empty() {
            return Err(ClientError::Unavailable("no cluster addresses".to_string()));
        }
        let request = ClientRequest::Command { command, read_mode };
        let mut last_error = ClientError::Unavailable("no node answered".to_string());

        for _ in 0..self.max_attempts {
            let addr = self.addrs[self.current].clone();
            let result = self.call(&addr, request.clone()).await.and_then(ClientReply::into_committed);
            match result {
                Ok(committed) => return Ok(committed),
                Err(ClientError::NotLeader { leader_addr: Some(leader), leader_hint }) => {
                    debug!(%addr, ?leader_hint, %leader, "redirected to leader");
                    self.current = self.index_of(leader);
                    last_error = ClientError::NotLeader { leader_hint, leader_addr: self.current_addr().map(str::to_string) };
                }
                Err(err) if err.is_redirect() => {
                    debug!(%addr, error = %err, "trying next node");
                    self.current = (self.current + 1) % self.addrs.len();
                    if matches!(err, ClientError::NotLeader { .. }) {
                        sleep(ELECTION_BACKOFF).await;
                    }
                    last_error = err;
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_error)
    }

    /// Ask one node for its status.
    pub async fn status(&mut self, addr: &str) -> Result<NodeStatus, ClientError> {
        match self.call(addr, ClientRequest::Status).await? {
            ClientReply::Status { status } => Ok(status),
            other => Err(ClientError::Protocol(format!("expected status, got {other:?}"))),
        }
    }

    fn index_of(&mut self, addr: String) -> usize {
        match self.addrs.iter().position(|known| *known == addr) {
            Some(index) => index,
            None => {
                self.addrs.push(addr);
                self.addrs.len() - 1
            }
        }
    }

    /// One request over a fresh connection.
    async fn call(&mut self, addr: &str, request: ClientRequest) -> Result<ClientReply, ClientError> {
        let id = self.next_id;
        self.next_id += 1;

        timeout(self.request_timeout, exchange(addr, id, request))
            .await
            .map_err(|_| ClientError::Timeout)?
    }
}

async fn exchange(addr: &str, id: u64, request: ClientRequest) -> Result<ClientReply, ClientError> {
    let stream = TcpStream::connect(addr).await?;
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    write_frame(&mut writer, &Frame::Request { id, request }).await?;
    match read_frame::<_, Frame>(&mut reader).await? {
        Some(Frame::Response { id: reply_id, reply }) if reply_id == id => Ok(reply),
        Some(other) => Err(ClientError::Protocol(format!("unexpected frame {other:?}"))),
        None => Err(ClientError::Unavailable(format!("{addr} closed the connection"))),
    }
}
