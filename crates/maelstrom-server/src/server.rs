//! # server
//!
//! why: one listening socket per node for both peers and clients
//! relations: forwards peer frames into the runtime's inbound channel, client frames to a NodeHandle
//! what: Server (accept loop with shutdown), per-connection handlers

use std::future::Future;
use std::io;
use std::net::SocketAddr;

use maelstrom_core::{Envelope, NodeId};
use tokio::io::{BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::protocol::{read_frame, write_frame, ClientReply, ClientRequest, Frame};
use crate::runtime::NodeHandle;

pub struct Server {
    listener: TcpListener,
    handle: NodeHandle,
    inbound: mpsc::UnboundedSender<Envelope>,
}

impl Server {
    /// Serve `handle` on an already bound listener. Peer envelopes are pushed
    /// into `inbound`, the same channel the node's decision loop reads.
    pub fn new(listener: TcpListener, handle: NodeHandle, inbound: mpsc::UnboundedSender<Envelope>) -> Self {
        Self { listener, handle, inbound }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server { listener, handle, inbound } = self;
        tokio::pin!(shutdown);
        info!(node = handle.id(), addr = ?listener.local_addr()?, "accepting connections");

        loop {
            select! {
                _ = &mut shutdown => {
                    info!(node = handle.id(), "server shutting down");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => spawn_connection(stream, peer, handle.clone(), inbound.clone()),
                    Err(err) => warn!(error = ?err, "failed to accept connection"),
                }
            }
        }
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> io::Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn spawn_connection(
    stream: TcpStream,
    addr: SocketAddr,
    handle: NodeHandle,
    inbound: mpsc::UnboundedSender<Envelope>,
) {
    tokio::spawn(async move {
        if let Err(err) = handle_connection(stream, handle, inbound).await {
            debug!(%addr, error = %err, "connection closed with error");
        }
    });
}

async fn handle_connection(
    stream: TcpStream,
    handle: NodeHandle,
    inbound: mpsc::UnboundedSender<Envelope>,
) -> io::Result<()> {
    stream.set_nodelay(true)?;
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    match read_frame::<_, Frame>(&mut reader).await? {
        Some(Frame::Hello { from }) => serve_peer(from, reader, inbound).await,
        Some(Frame::Request { id, request }) => {
            let mut writer = BufWriter::new(writer);
            answer(&handle, id, request, &mut writer).await?;
            serve_client(reader, writer, handle).await
        }
        Some(other) => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected opening frame {other:?}"),
        )),
        None => Ok(()),
    }
}

async fn serve_peer(
    from: NodeId,
    mut reader: BufReader<OwnedReadHalf>,
    inbound: mpsc::UnboundedSender<Envelope>,
) -> io::Result<()> {
    debug!(peer = from, "peer connected");
    while let Some(frame) = read_frame::<_, Frame>(&mut reader).await? {
        match frame {
            Frame::Raft { envelope } if envelope.from == from => {
                if inbound.send(envelope).is_err() {
                    // decision loop is gone
                    break;
                }
            }
            other => warn!(peer = from, "ignoring frame {other:?} on peer connection"),
        }
    }
    debug!(peer = from, "peer disconnected");
    Ok(())
}

async fn serve_client(
    mut reader: BufReader<OwnedReadHalf>,
    mut writer: BufWriter<OwnedWriteHalf>,
    handle: NodeHandle,
) -> io::Result<()> {
    while let Some(frame) = read_frame::<_, Frame>(&mut reader).await? {
        match frame {
            Frame::Request { id, request } => answer(&handle, id, request, &mut writer).await?,
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unexpected frame {other:?} on client connection"),
                ))
            }
        }
    }
    Ok(())
}

async fn answer(
    handle: &NodeHandle,
    id: u64,
    request: ClientRequest,
    writer: &mut BufWriter<OwnedWriteHalf>,
) -> io::Result<()> {
    let reply = match request {
        ClientRequest::Command { command, read_mode } => handle.submit(command, read_mode).await.into(),
        ClientRequest::Status => ClientReply::Status { status: handle.status() },
    };
    write_frame(writer, &Frame::Response { id, reply }).await
}
