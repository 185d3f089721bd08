//! # protocol
//!
//! why: one framing for everything that crosses a socket
//! relations: written by transport.rs and client.rs, read by server.rs
//! what: Frame, ClientRequest / ClientReply, ReadMode, read_frame / write_frame
//!
//! Each frame is one JSON object on its own line. A peer opens its connection
//! with `hello`; a client connection starts straight away with `request`.

use std::io;

use maelstrom_core::{Command, CommandOutput, Envelope, LogIndex, NodeId, NodeStatus};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::coordinator::Committed;
use crate::ClientError;

const LINE_ENDINGS: &[char] = &['\n', '\r'];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// First frame on a peer connection
    Hello { from: NodeId },
    Raft { envelope: Envelope },
    Request { id: u64, request: ClientRequest },
    Response { id: u64, reply: ClientReply },
}

/// How a read is served.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadMode {
    /// Goes through the log like a write
    #[default]
    Linearizable,
    /// Answered from the local state machine on any node, possibly out of date
    Stale,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClientRequest {
    Command {
        command: Command,
        #[serde(default)]
        read_mode: ReadMode,
    },
    Status,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClientReply {
    Committed { output: CommandOutput, index: LogIndex },
    Status { status: NodeStatus },
    NotLeader {
        leader_hint: Option<NodeId>,
        leader_addr: Option<String>,
    },
    LostLeadership,
    Timeout,
    Unavailable { reason: String },
}

impl ClientReply {
    /// Turn a command reply back into the result the node produced.
    pub fn into_committed(self) -> Result<Committed, ClientError> {
        match self {
            ClientReply::Committed { output, index } => Ok(Committed { output, index }),
            ClientReply::Status { .. } => {
                Err(ClientError::Protocol("expected a command reply, got status".to_string()))
            }
            other => Err(other.into_error()),
        }
    }

    fn into_error(self) -> ClientError {
        match self {
            ClientReply::NotLeader { leader_hint, leader_addr } => {
                ClientError::NotLeader { leader_hint, leader_addr }
            }
            ClientReply::LostLeadership => ClientError::LostLeadership,
            ClientReply::Timeout => ClientError::Timeout,
            ClientReply::Unavailable { reason } => ClientError::Unavailable(reason),
            ClientReply::Committed { .. } | ClientReply::Status { .. } => {
                ClientError::Protocol("unexpected reply".to_string())
            }
        }
    }
}

impl From<Result<Committed, ClientError>> for ClientReply {
    fn from(result: Result<Committed, ClientError>) -> Self {
        match result {
            Ok(Committed { output, index }) => ClientReply::Committed { output, index },
            Err(ClientError::NotLeader { leader_hint, leader_addr }) => {
                ClientReply::NotLeader { leader_hint, leader_addr }
            }
            Err(ClientError::LostLeadership) => ClientReply::LostLeadership,
            Err(ClientError::Timeout) => ClientReply::Timeout,
            Err(err) => ClientReply::Unavailable { reason: err.to_string() },
        }
    }
}

/// Read the next frame, skipping blank lines. `None` at end of stream.
pub async fn read_frame<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    loop {
        line.clear();
        let bytes = reader.read_line(&mut line).await?;
        if bytes == 0 {
            return Ok(None);
        }

        let trimmed = line.trim_end_matches(LINE_ENDINGS);
        if trimmed.is_empty() {
            continue;
        }

        let parsed = serde_json::from_str(trimmed).map_err(to_io_error)?;
        return Ok(Some(parsed));
    }
}

pub async fn write_frame<W, T>(writer: &mut W, frame: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut encoded = serde_json::to_vec(frame).map_err(to_io_error)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}
