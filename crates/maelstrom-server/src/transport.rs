//! # transport
//!
//! why: get envelopes from one node's decision loop to another's without ever blocking the loop
//! relations: runtime.rs sends through a Transport; server.rs feeds inbound TCP frames to the loop
//! what: Transport trait, TcpTransport (one writer task per peer), LocalNetwork (in-process, partitionable)

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use maelstrom_core::{ClusterConfig, Envelope, NodeId};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tracing::{debug, trace, warn};

use crate::protocol::{write_frame, Frame};

/// Wait this long after a failed connect before dialing the same peer again.
const RECONNECT_BACKOFF: Duration = Duration::from_millis(200);
const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

/// Fire-and-forget delivery of envelopes to peers.
///
/// `send` must not block. Lost messages are fine: the protocol resends on the
/// next heartbeat.
pub trait Transport: Send + 'static {
    fn send(&self, envelope: Envelope);
}

// -----------------------------------------------------------------------------
// TCP
// -----------------------------------------------------------------------------

/// Sends over one long-lived TCP connection per peer.
///
/// Each peer gets a writer task fed by an unbounded channel, so a slow or dead
/// peer only ever delays its own traffic.
pub struct TcpTransport {
    peers: BTreeMap<NodeId, mpsc::UnboundedSender<Envelope>>,
}

impl TcpTransport {
    /// Spawn a writer task for every other member of `cluster`.
    /// Must be called from inside a tokio runtime.
    pub fn connect(id: NodeId, cluster: &ClusterConfig) -> Self {
        let peers = cluster
            .peers_of(id)
            .map(|(peer, addr)| {
                let (tx, rx) = mpsc::unbounded_channel();
                tokio::spawn(peer_writer(id, peer, addr.to_string(), rx));
                (peer, tx)
            })
            .collect();
        Self { peers }
    }
}

impl Transport for TcpTransport {
    fn send(&self, envelope: Envelope) {
        match self.peers.get(&envelope.to) {
            Some(tx) => {
                // only fails once the writer task has gone away with the runtime
                let _ = tx.send(envelope);
            }
            None => warn!(to = envelope.to, "no address for peer, dropping message"),
        }
    }
}

async fn peer_writer(from: NodeId, peer: NodeId, addr: String, mut rx: mpsc::UnboundedReceiver<Envelope>) {
    let mut stream: Option<TcpStream> = None;
    let mut retry_at: Option<Instant> = None;

    while let Some(envelope) = rx.recv().await {
        if stream.is_none() {
            if retry_at.is_some_and(|at| Instant::now() < at) {
                trace!(peer, "peer down, dropping {}", envelope.message.kind());
                continue;
            }
            match dial(from, &addr).await {
                Ok(connected) => {
                    debug!(peer, %addr, "connected to peer");
                    stream = Some(connected);
                    retry_at = None;
                }
                Err(err) => {
                    debug!(peer, %addr, error = %err, "peer unreachable");
                    retry_at = Some(Instant::now() + RECONNECT_BACKOFF);
                    continue;
                }
            }
        }

        let Some(connection) = stream.as_mut() else { continue };
        if let Err(err) = write_frame(connection, &Frame::Raft { envelope }).await {
            debug!(peer, error = %err, "peer connection lost");
            stream = None;
        }
    }

    if let Some(mut connection) = stream {
        let _ = connection.shutdown().await;
    }
}

async fn dial(from: NodeId, addr: &str) -> std::io::Result<TcpStream> {
    let mut stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"))??;
    stream.set_nodelay(true)?;
    write_frame(&mut stream, &Frame::Hello { from }).await?;
    Ok(stream)
}

// -----------------------------------------------------------------------------
// in-process
// -----------------------------------------------------------------------------

#[derive(Default)]
struct NetworkState {
    inboxes: BTreeMap<NodeId, mpsc::UnboundedSender<Envelope>>,
    /// directed links that currently drop everything
    blocked: BTreeSet<(NodeId, NodeId)>,
}

/// In-process network connecting nodes of one test cluster through channels.
///
/// Links can be cut per direction to model partitions.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Attach node `id`, replacing any previous inbox it had.
    pub fn register(&self, id: NodeId) -> (LocalTransport, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().inboxes.insert(id, tx);
        (LocalTransport { network: self.clone() }, rx)
    }

    /// Detach node `id`; messages to it are dropped until it registers again.
    pub fn unregister(&self, id: NodeId) {
        self.lock().inboxes.remove(&id);
    }

    pub fn block(&self, from: NodeId, to: NodeId) {
        self.lock().blocked.insert((from, to));
    }

    pub fn block_both(&self, a: NodeId, b: NodeId) {
        let mut state = self.lock();
        state.blocked.insert((a, b));
        state.blocked.insert((b, a));
    }

    /// Split the registered nodes into groups that cannot reach each other.
    pub fn partition(&self, groups: &[&[NodeId]]) {
        let mut state = self.lock();
        for (i, left) in groups.iter().enumerate() {
            for right in groups.iter().skip(i + 1) {
                for a in left.iter() {
                    for b in right.iter() {
                        state.blocked.insert((*a, *b));
                        state.blocked.insert((*b, *a));
                    }
                }
            }
        }
    }

    pub fn heal(&self) {
        self.lock().blocked.clear();
    }

    fn deliver(&self, envelope: Envelope) {
        let state = self.lock();
        if state.blocked.contains(&(envelope.from, envelope.to)) {
            trace!(from = envelope.from, to = envelope.to, "link blocked, dropping {}", envelope.message.kind());
            return;
        }
        if let Some(inbox) = state.inboxes.get(&envelope.to) {
            let _ = inbox.send(envelope);
        }
    }
}

pub struct LocalTransport {
    network: LocalNetwork,
}

impl Transport for LocalTransport {
    fn send(&self, envelope: Envelope) {
        self.network.deliver(envelope);
    }
}
