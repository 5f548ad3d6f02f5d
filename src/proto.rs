//! Agent wire protocol: message schemas, status codes, and framing.
//!
//! Every message is one [`Frame`], length-prefixed with a 4-byte big-endian
//! payload size and encoded with postcard. Client and agent are always built
//! and shipped together, so the encoding carries no version negotiation.
//!
//! The RPC surface is one method per host operation plus `Ping` and
//! `Shutdown`. Two methods stream:
//!
//! - `ReadFile` is server-streaming: zero or more [`Frame::Data`] chunks of
//!   up to [`READ_CHUNK`] bytes followed by a terminal [`Frame::Reply`].
//!   Open-time errors arrive as an immediate error reply before any data.
//! - `WriteFile` is client-streaming: the [`Request::WriteFile`] metadata,
//!   then [`Frame::Data`] chunks of up to [`WRITE_CHUNK`] bytes, then
//!   [`Frame::End`]; the agent answers with a single reply after applying
//!   the mode to the completed file.
//!
//! Neither side buffers full file content.

use std::io;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::host::{DirEnt, Group, HostError, Stat, User, WaitStatus};

/// Chunk size for agent-to-client file streaming.
pub const READ_CHUNK: usize = 8 * 1024;

/// Chunk size for client-to-agent file streaming.
pub const WRITE_CHUNK: usize = 1024;

/// Upper bound on an encoded frame. Generously above the largest chunk plus
/// framing overhead; anything bigger is a protocol violation.
pub const MAX_FRAME: usize = 4 * 1024 * 1024;

// ── Status codes ────────────────────────────────────────────────────────

/// Coarse wire-level error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCode {
    Ok,
    PermissionDenied,
    NotFound,
    AlreadyExists,
    Internal,
}

/// Per-call status shipped with every reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub code: StatusCode,
    pub message: String,
}

impl Status {
    pub fn ok() -> Self {
        Self {
            code: StatusCode::Ok,
            message: String::new(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            code: StatusCode::Internal,
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }

    /// Normalize a host error into a wire status.
    pub fn from_error(err: &HostError) -> Self {
        let code = match err {
            HostError::PermissionDenied => StatusCode::PermissionDenied,
            HostError::NotExist => StatusCode::NotFound,
            HostError::Exist => StatusCode::AlreadyExists,
            _ => StatusCode::Internal,
        };
        Self {
            code,
            message: err.to_string(),
        }
    }

    /// Rehydrate a non-`Ok` status into the host error taxonomy.
    ///
    /// `UnknownUser`/`UnknownGroup` have no dedicated wire code; they are
    /// reconstituted from the message the server formats for them.
    pub fn into_error(self) -> HostError {
        match self.code {
            StatusCode::Ok => HostError::other("unexpected Ok status"),
            StatusCode::PermissionDenied => HostError::PermissionDenied,
            StatusCode::NotFound => HostError::NotExist,
            StatusCode::AlreadyExists => HostError::Exist,
            StatusCode::Internal => {
                if let Some(name) = self.message.strip_prefix("user: unknown user ") {
                    HostError::UnknownUser(name.to_string())
                } else if let Some(name) = self.message.strip_prefix("group: unknown group ") {
                    HostError::UnknownGroup(name.to_string())
                } else {
                    HostError::Other(self.message)
                }
            }
        }
    }
}

// ── Requests and replies ────────────────────────────────────────────────

/// One request body per host operation, plus `Ping` and `Shutdown`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    Ping,
    Shutdown,
    Chmod {
        path: String,
        mode: u32,
    },
    Chown {
        path: String,
        uid: u32,
        gid: u32,
    },
    Lookup {
        username: String,
    },
    LookupGroup {
        name: String,
    },
    Lstat {
        path: String,
    },
    ReadDir {
        path: String,
    },
    Mkdir {
        path: String,
        mode: u32,
    },
    ReadFile {
        path: String,
    },
    WriteFile {
        path: String,
        mode: u32,
    },
    Symlink {
        oldname: String,
        newname: String,
    },
    ReadLink {
        path: String,
    },
    Remove {
        path: String,
    },
    Mknod {
        path: String,
        mode: u32,
        dev: u64,
    },
    Run {
        path: String,
        args: Vec<String>,
        env: Option<Vec<String>>,
        dir: Option<String>,
        stdin: Vec<u8>,
    },
    Geteuid,
    Getegid,
}

impl Request {
    /// The operation name used in log records and path-validation errors.
    pub fn op(&self) -> &'static str {
        match self {
            Request::Ping => "Ping",
            Request::Shutdown => "Shutdown",
            Request::Chmod { .. } => "Chmod",
            Request::Chown { .. } => "Chown",
            Request::Lookup { .. } => "Lookup",
            Request::LookupGroup { .. } => "LookupGroup",
            Request::Lstat { .. } => "Lstat",
            Request::ReadDir { .. } => "ReadDir",
            Request::Mkdir { .. } => "Mkdir",
            Request::ReadFile { .. } => "ReadFile",
            Request::WriteFile { .. } => "WriteFile",
            Request::Symlink { .. } => "Symlink",
            Request::ReadLink { .. } => "ReadLink",
            Request::Remove { .. } => "Remove",
            Request::Mknod { .. } => "Mknod",
            Request::Run { .. } => "Run",
            Request::Geteuid => "Geteuid",
            Request::Getegid => "Getegid",
        }
    }
}

/// Typed reply payloads. Operations without a payload reply with a bare
/// status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Reply {
    Ping {
        message: String,
    },
    User(User),
    Group(Group),
    Stat(Stat),
    DirEnts(Vec<DirEnt>),
    Link {
        target: String,
    },
    Run {
        status: WaitStatus,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
    },
    Uid(u32),
    Gid(u32),
}

// ── Frames ──────────────────────────────────────────────────────────────

/// The multiplexed wire unit. `id` correlates frames belonging to one call;
/// calls on one connection interleave freely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    /// Open a call.
    Request { id: u64, body: Request },
    /// Terminal answer for a call.
    Reply {
        id: u64,
        status: Status,
        body: Option<Reply>,
    },
    /// A streamed chunk belonging to an open call.
    Data { id: u64, chunk: Vec<u8> },
    /// Client half-close of a client-streaming call.
    End { id: u64 },
    /// Abandon a call; the peer stops work and sends nothing further for it.
    Cancel { id: u64 },
}

// ── Framing codec ───────────────────────────────────────────────────────

/// Write one length-prefixed frame and flush.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let payload =
        postcard::to_stdvec(frame).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if payload.len() > MAX_FRAME {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit", payload.len()),
        ));
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await
}

/// Read one length-prefixed frame. Returns `Ok(None)` on a clean
/// end-of-stream at a frame boundary.
pub async fn read_frame<R>(reader: &mut R) -> io::Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut len = [0u8; 4];
    match reader.read_exact(&mut len).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len) as usize;
    if len > MAX_FRAME {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    postcard::from_bytes(&payload)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
