//! # runtime
//!
//! why: give each RaftNode a single owner that reacts to peers, clients and time
//! relations: drives maelstrom-core's RaftNode and KvStore, answers through coordinator.rs, sends through transport.rs
//! what: spawn_node, NodeHandle (async client API), Worker (the decision loop)
//!
//! The Worker task owns the node, the state machine and the coordinator.
//! Everything else talks to it through channels:
//!
//! - **inbound** envelopes from peers (TCP reader tasks or the local network)
//! - **requests** from `NodeHandle`s (client commands, campaign, shutdown)
//! - **ticks** from a `tokio::time::interval`
//!
//! Status snapshots go out through a `watch` channel after every event.

use std::time::Duration;

use maelstrom_core::{
    ClusterConfig, Command, CommandOutput, Envelope, KvStore, NodeId, NodeState, NodeStatus,
    RaftConfig, RaftError, RaftNode, RaftResult, Storage, Term,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::coordinator::{read_stale, Committed, Reply, RequestCoordinator};
use crate::protocol::ReadMode;
use crate::transport::Transport;
use crate::ClientError;

/// Depth of the client request queue in front of the decision loop.
const REQUEST_QUEUE: usize = 1024;

/// Settings for one running node.
#[derive(Debug, Clone)]
pub struct NodeOptions {
    pub id: NodeId,
    pub cluster: ClusterConfig,
    pub raft: RaftConfig,
    /// How often the decision loop advances the node's clocks
    pub tick_interval: Duration,
    /// How long a `NodeHandle` call waits before giving up
    pub request_timeout: Duration,
}

impl NodeOptions {
    pub fn new(id: NodeId, cluster: ClusterConfig) -> Self {
        Self {
            id,
            cluster,
            raft: RaftConfig::default(),
            tick_interval: Duration::from_millis(10),
            request_timeout: Duration::from_secs(5),
        }
    }
}

/// Requests sent from handles to the worker.
enum Request {
    Submit {
        command: Command,
        read_mode: ReadMode,
        respond_to: Reply,
    },
    Campaign {
        respond_to: oneshot::Sender<Result<(), ClientError>>,
    },
    Shutdown,
}

/// Cloneable handle to a running node.
#[derive(Clone)]
pub struct NodeHandle {
    id: NodeId,
    requests: mpsc::Sender<Request>,
    status: watch::Receiver<NodeStatus>,
    request_timeout: Duration,
}

impl NodeHandle {
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Run `command` through the log (or, for a stale read, straight against
    /// the local state machine) and wait for the result.
    pub async fn submit(&self, command: Command, read_mode: ReadMode) -> Result<Committed, ClientError> {
        let (respond_to, response) = oneshot::channel();
        self.send(Request::Submit { command, read_mode, respond_to }).await?;
        self.wait(response).await?
    }

    pub async fn put(&self, key: impl Into<String>, value: impl Into<String>) -> Result<Committed, ClientError> {
        self.submit(Command::put(key, value), ReadMode::Linearizable).await
    }

    /// Delete `key`; true when it existed.
    pub async fn delete(&self, key: impl Into<String>) -> Result<bool, ClientError> {
        match self.submit(Command::delete(key), ReadMode::Linearizable).await?.output {
            CommandOutput::Deleted { existed } => Ok(existed),
            other => Err(unexpected(other)),
        }
    }

    /// Linearizable read: only a leader answers, after the read commits.
    pub async fn get(&self, key: impl Into<String>) -> Result<Option<String>, ClientError> {
        self.read(key, ReadMode::Linearizable).await
    }

    /// Read whatever this node has applied so far.
    pub async fn get_stale(&self, key: impl Into<String>) -> Result<Option<String>, ClientError> {
        self.read(key, ReadMode::Stale).await
    }

    async fn read(&self, key: impl Into<String>, read_mode: ReadMode) -> Result<Option<String>, ClientError> {
        match self.submit(Command::get(key), read_mode).await?.output {
            CommandOutput::Value(value) => Ok(value),
            other => Err(unexpected(other)),
        }
    }

    /// Latest published status.
    pub fn status(&self) -> NodeStatus {
        *self.status.borrow()
    }

    /// Receiver that sees every status change.
    pub fn subscribe(&self) -> watch::Receiver<NodeStatus> {
        self.status.clone()
    }

    /// Wait until the published status satisfies `predicate`.
    pub async fn wait_for(
        &self,
        max: Duration,
        mut predicate: impl FnMut(&NodeStatus) -> bool,
    ) -> Result<NodeStatus, ClientError> {
        let mut status = self.subscribe();
        let result = time::timeout(max, status.wait_for(|s| predicate(s))).await;
        match result {
            Ok(Ok(found)) => Ok(*found),
            Ok(Err(_)) => Err(stopped()),
            Err(_) => Err(ClientError::Timeout),
        }
    }

    /// Start an election on this node now.
    pub async fn campaign(&self) -> Result<(), ClientError> {
        let (respond_to, response) = oneshot::channel();
        self.send(Request::Campaign { respond_to }).await?;
        self.wait(response).await?
    }

    /// Ask the worker to stop. Pending requests fail with `Unavailable`.
    pub async fn shutdown(&self) {
        let _ = self.requests.send(Request::Shutdown).await;
    }

    async fn send(&self, request: Request) -> Result<(), ClientError> {
        self.requests.send(request).await.map_err(|_| stopped())
    }

    async fn wait<T>(&self, response: oneshot::Receiver<T>) -> Result<T, ClientError> {
        match time::timeout(self.request_timeout, response).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(stopped()),
            Err(_) => Err(ClientError::Timeout),
        }
    }
}

fn stopped() -> ClientError {
    ClientError::Unavailable("node stopped".to_string())
}

fn unexpected(output: CommandOutput) -> ClientError {
    ClientError::Protocol(format!("unexpected command output {output:?}"))
}

/// Start a node's decision loop on the current tokio runtime.
///
/// `inbound` carries envelopes addressed to this node; `transport` carries the
/// ones it sends. The returned task ends with an error if the node halts on a
/// storage failure.
pub fn spawn_node<S, T>(
    options: NodeOptions,
    storage: S,
    transport: T,
    inbound: mpsc::UnboundedReceiver<Envelope>,
) -> RaftResult<(NodeHandle, JoinHandle<RaftResult<()>>)>
where
    S: Storage + Send + 'static,
    T: Transport,
{
    let node = RaftNode::with_config(options.id, options.cluster.clone(), options.raft.clone(), storage)?;
    let (requests_tx, requests_rx) = mpsc::channel(REQUEST_QUEUE);
    let (status_tx, status_rx) = watch::channel(node.status());

    let worker = Worker {
        node,
        store: KvStore::new(),
        coordinator: RequestCoordinator::new(),
        transport,
        requests: requests_rx,
        inbound,
        status: status_tx,
        tick_interval: options.tick_interval,
        leader_term: None,
    };
    let task = tokio::spawn(worker.run());

    let handle = NodeHandle {
        id: options.id,
        requests: requests_tx,
        status: status_rx,
        request_timeout: options.request_timeout,
    };
    Ok((handle, task))
}

/// Owner of a RaftNode and everything derived from it.
struct Worker<S: Storage, T> {
    node: RaftNode<S>,
    store: KvStore,
    coordinator: RequestCoordinator,
    transport: T,
    requests: mpsc::Receiver<Request>,
    inbound: mpsc::UnboundedReceiver<Envelope>,
    status: watch::Sender<NodeStatus>,
    tick_interval: Duration,
    /// term this node was leader in after the previous event
    leader_term: Option<Term>,
}

/// What woke the loop up.
enum Event {
    Inbound(Envelope),
    Request(Request),
    Tick(u64),
    Stop,
}

impl<S: Storage, T: Transport> Worker<S, T> {
    async fn run(mut self) -> RaftResult<()> {
        let mut ticker = time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_tick = Instant::now();
        info!(node = self.node.id(), members = self.node.cluster().len(), "decision loop started");

        loop {
            let event = tokio::select! {
                Some(envelope) = self.inbound.recv() => Event::Inbound(envelope),
                request = self.requests.recv() => match request {
                    Some(Request::Shutdown) | None => Event::Stop,
                    Some(request) => Event::Request(request),
                },
                now = ticker.tick() => {
                    let elapsed = now.duration_since(last_tick).as_millis() as u64;
                    last_tick = now;
                    Event::Tick(elapsed)
                }
            };

            let result = match event {
                Event::Inbound(envelope) => self.node.step(envelope.from, envelope.message),
                Event::Request(request) => self.handle_request(request),
                Event::Tick(elapsed) => self.node.tick(elapsed),
                Event::Stop => break,
            };

            match result {
                Ok(envelopes) => self.dispatch(envelopes),
                Err(err) if err.is_fatal() => return Err(self.halt(err)),
                Err(err) => warn!(node = self.node.id(), error = %err, "event rejected"),
            }
            self.after_event();
        }

        info!(node = self.node.id(), "decision loop stopped");
        self.coordinator
            .fail_all_with(|| ClientError::Unavailable("node shut down".to_string()));
        Ok(())
    }

    fn handle_request(&mut self, request: Request) -> RaftResult<Vec<Envelope>> {
        match request {
            Request::Submit { command: Command::Get { key }, read_mode: ReadMode::Stale, respond_to } => {
                let _ = respond_to.send(Ok(read_stale(&self.store, &key)));
                Ok(Vec::new())
            }
            // writes always go through the log, whatever the caller asked for
            Request::Submit { command, respond_to, .. } => {
                self.coordinator.submit(&mut self.node, &command, respond_to)
            }
            Request::Campaign { respond_to } => {
                let result = self.node.campaign();
                let reply = match &result {
                    Ok(_) => Ok(()),
                    Err(err) => Err(ClientError::Unavailable(err.to_string())),
                };
                let _ = respond_to.send(reply);
                result
            }
            Request::Shutdown => Ok(Vec::new()),
        }
    }

    fn dispatch(&self, envelopes: Vec<Envelope>) {
        for envelope in envelopes {
            self.transport.send(envelope);
        }
    }

    /// Apply newly committed entries, settle requests that can no longer
    /// commit here, publish status.
    fn after_event(&mut self) {
        for entry in self.node.take_committed() {
            let output = self.store.apply(&entry);
            debug!(node = self.node.id(), index = entry.index, term = entry.term, ?output, "applied entry");
            self.coordinator.on_applied(&entry, output);
        }

        let status = self.node.status();
        let leader_term = (status.state == NodeState::Leader).then_some(status.term);
        if leader_term != self.leader_term {
            if let Some(term) = self.leader_term {
                info!(node = status.id, term, now = ?status.state, new_term = status.term, "no longer leader");
                self.coordinator.fail_all();
            }
            self.leader_term = leader_term;
        }

        self.status.send_if_modified(|current| {
            let changed = *current != status;
            *current = status;
            changed
        });
    }

    fn halt(&mut self, err: RaftError) -> RaftError {
        error!(node = self.node.id(), error = %err, "node halted, leaving decision loop");
        self.coordinator
            .fail_all_with(|| ClientError::Unavailable("node halted after a storage failure".to_string()));
        self.status.send_replace(self.node.status());
        err
    }
}
