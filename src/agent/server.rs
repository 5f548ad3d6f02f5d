//! Agent-side serve loop.
//!
//! The agent wraps its own stdin/stdout in a [`PipeConn`], yields it
//! through a single-shot [`PipeListener`], and serves the protocol on it:
//! one task per request, replies multiplexed through a writer task.
//!
//! `Shutdown` replies `Ok`, stops reading, lets in-flight requests finish
//! within [`SHUTDOWN_GRACE`], then aborts stragglers and tears the server
//! down. End-of-stream on stdin is treated the same way, so a vanished
//! client cannot leave the process behind.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadBuf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinSet};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::host::HostError;
use crate::pipe::{PipeConn, PipeListener};
use crate::proto::{self, Frame, READ_CHUNK, Request, Status};

use super::service::AgentService;

/// How long in-flight requests (including open `ReadFile` streams) may keep
/// running after `Shutdown` before they are aborted.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Queue depth for outgoing frames and per-stream chunk delivery.
const CHANNEL_DEPTH: usize = 32;

/// Delete this process's own executable.
///
/// Called at startup so that abnormal termination leaves nothing staged on
/// the machine; the bootstrap relies on this instead of cleaning up
/// remotely.
pub fn unlink_self() {
    match std::env::current_exe() {
        Ok(path) => {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "could not unlink own binary");
            }
        }
        Err(e) => warn!(error = %e, "could not resolve own binary path"),
    }
}

/// Serve the agent protocol over this process's stdin/stdout until the
/// client shuts us down or disconnects.
pub async fn serve_stdio() -> anyhow::Result<()> {
    let conn = PipeConn::new(
        Box::new(tokio::io::stdin()),
        Box::new(tokio::io::stdout()),
    );
    let listener = PipeListener::single(conn);
    let service = Arc::new(AgentService::new());
    while let Some(conn) = listener.accept().await {
        serve_conn(conn, Arc::clone(&service)).await?;
    }
    Ok(())
}

enum WriteEvent {
    Data(Vec<u8>),
    End,
}

pub(crate) async fn serve_conn(conn: PipeConn, service: Arc<AgentService>) -> anyhow::Result<()> {
    let (mut rd, wr) = tokio::io::split(conn);
    let (tx, rx) = mpsc::channel::<Frame>(CHANNEL_DEPTH);
    let writer = tokio::spawn(write_loop(wr, rx));

    let mut inflight: JoinSet<()> = JoinSet::new();
    let mut aborts: HashMap<u64, AbortHandle> = HashMap::new();
    let mut write_streams: HashMap<u64, mpsc::Sender<WriteEvent>> = HashMap::new();

    loop {
        // Reap finished handlers and drop their stale abort handles.
        while inflight.try_join_next().is_some() {}
        aborts.retain(|_, handle| !handle.is_finished());

        let frame = match proto::read_frame(&mut rd).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!("client closed the connection");
                break;
            }
            Err(e) => {
                warn!(error = %e, "transport error, shutting down");
                break;
            }
        };
        match frame {
            Frame::Request {
                id,
                body: Request::Shutdown,
            } => {
                debug!("shutdown requested");
                let _ = tx
                    .send(Frame::Reply {
                        id,
                        status: Status::ok(),
                        body: None,
                    })
                    .await;
                break;
            }
            Frame::Request {
                id,
                body: Request::ReadFile { path },
            } => {
                let handle =
                    inflight.spawn(read_file_call(Arc::clone(&service), id, path, tx.clone()));
                aborts.insert(id, handle);
            }
            Frame::Request {
                id,
                body: Request::WriteFile { path, mode },
            } => {
                let (wtx, wrx) = mpsc::channel(CHANNEL_DEPTH);
                write_streams.insert(id, wtx);
                let handle = inflight.spawn(write_file_call(
                    Arc::clone(&service),
                    id,
                    path,
                    mode,
                    wrx,
                    tx.clone(),
                ));
                aborts.insert(id, handle);
            }
            Frame::Request { id, body } => {
                trace!(id, op = body.op(), "request");
                let handle = inflight.spawn(unary_call(Arc::clone(&service), id, body, tx.clone()));
                aborts.insert(id, handle);
            }
            Frame::Data { id, chunk } => {
                let sender = write_streams.get(&id).cloned();
                match sender {
                    Some(sender) => {
                        if sender.send(WriteEvent::Data(chunk)).await.is_err() {
                            write_streams.remove(&id);
                        }
                    }
                    None => trace!(id, "chunk for unknown stream"),
                }
            }
            Frame::End { id } => {
                if let Some(sender) = write_streams.remove(&id) {
                    let _ = sender.send(WriteEvent::End).await;
                }
            }
            Frame::Cancel { id } => {
                trace!(id, "cancelled by client");
                if let Some(handle) = aborts.remove(&id) {
                    handle.abort();
                }
                write_streams.remove(&id);
            }
            Frame::Reply { .. } => {
                warn!("protocol violation: client-originated reply ignored");
            }
        }
    }

    // No new requests past this point; in-flight calls get a bounded grace
    // period, then are aborted.
    drop(write_streams);
    let drain = async {
        while inflight.join_next().await.is_some() {}
    };
    if timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        warn!(grace_secs = SHUTDOWN_GRACE.as_secs(), "aborting in-flight requests");
        inflight.shutdown().await;
    }
    drop(tx);
    let _ = writer.await;
    Ok(())
}

async fn unary_call(service: Arc<AgentService>, id: u64, body: Request, tx: mpsc::Sender<Frame>) {
    let (status, reply) = service.dispatch(body).await;
    let _ = tx
        .send(Frame::Reply {
            id,
            status,
            body: reply,
        })
        .await;
}

async fn read_file_call(service: Arc<AgentService>, id: u64, path: String, tx: mpsc::Sender<Frame>) {
    let mut reader = match service.open_read(&path).await {
        Ok(reader) => reader,
        Err(e) => {
            let _ = tx
                .send(Frame::Reply {
                    id,
                    status: Status::from_error(&e),
                    body: None,
                })
                .await;
            return;
        }
    };
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                let _ = tx
                    .send(Frame::Reply {
                        id,
                        status: Status::ok(),
                        body: None,
                    })
                    .await;
                return;
            }
            Ok(n) => {
                let sent = tx
                    .send(Frame::Data {
                        id,
                        chunk: buf[..n].to_vec(),
                    })
                    .await;
                if sent.is_err() {
                    return;
                }
            }
            Err(e) => {
                let err = HostError::other(format!("read {path}: {e}"));
                let _ = tx
                    .send(Frame::Reply {
                        id,
                        status: Status::from_error(&err),
                        body: None,
                    })
                    .await;
                return;
            }
        }
    }
}

async fn write_file_call(
    service: Arc<AgentService>,
    id: u64,
    path: String,
    mode: u32,
    chunks: mpsc::Receiver<WriteEvent>,
    tx: mpsc::Sender<Frame>,
) {
    let mut src = ChunkSource::new(chunks);
    let status = match service.write_file(&path, &mut src, mode).await {
        Ok(()) => Status::ok(),
        Err(e) => Status::from_error(&e),
    };
    let _ = tx
        .send(Frame::Reply {
            id,
            status,
            body: None,
        })
        .await;
}

/// Adapts the incoming chunk channel of a client-streaming write into an
/// `AsyncRead`. `End` is end-of-file; a dropped channel (client vanished or
/// cancelled) is an error so a partial write never reports success.
struct ChunkSource {
    buffer: Vec<u8>,
    pos: usize,
    rx: mpsc::Receiver<WriteEvent>,
    ended: bool,
}

impl ChunkSource {
    fn new(rx: mpsc::Receiver<WriteEvent>) -> Self {
        Self {
            buffer: Vec::new(),
            pos: 0,
            rx,
            ended: false,
        }
    }
}

impl AsyncRead for ChunkSource {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        loop {
            if self.pos < self.buffer.len() {
                let n = (self.buffer.len() - self.pos).min(buf.remaining());
                buf.put_slice(&self.buffer[self.pos..self.pos + n]);
                self.pos += n;
                return Poll::Ready(Ok(()));
            }
            if self.ended {
                return Poll::Ready(Ok(()));
            }
            match self.rx.poll_recv(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(WriteEvent::Data(chunk))) => {
                    self.buffer = chunk;
                    self.pos = 0;
                }
                Poll::Ready(Some(WriteEvent::End)) => {
                    self.ended = true;
                }
                Poll::Ready(None) => {
                    return Poll::Ready(Err(std::io::Error::other("write stream interrupted")));
                }
            }
        }
    }
}

async fn write_loop(mut wr: WriteHalf<PipeConn>, mut rx: mpsc::Receiver<Frame>) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = proto::write_frame(&mut wr, &frame).await {
            debug!(error = %e, "reply write failed");
            return;
        }
    }
    let _ = wr.shutdown().await;
}
