//! Multiplexed RPC client over a single [`PipeConn`].
//!
//! Many caller tasks issue calls concurrently; frames for independent calls
//! interleave on the one connection, correlated by id. A reader task routes
//! incoming frames to per-call channels and a writer task serializes
//! outgoing frames, so the connection is owned by exactly two tasks.
//!
//! Failure model: any transport error fails every pending call with the
//! original message and poisons the client; subsequent calls fail
//! immediately. Dropping a pending call future or a [`ReadStream`] sends
//! `Cancel` for that id without affecting sibling calls.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::host::{HostError, HostResult, joined_result};
use crate::pipe::PipeConn;
use crate::proto::{self, Frame, Reply, Request, Status, WRITE_CHUNK};

/// Queue depth for outgoing frames and per-stream chunk delivery.
const CHANNEL_DEPTH: usize = 32;

enum Pending {
    Unary(oneshot::Sender<(Status, Option<Reply>)>),
    Stream(mpsc::Sender<StreamEvent>),
}

enum StreamEvent {
    Data(Vec<u8>),
    Done(Status),
}

struct Shared {
    pending: StdMutex<HashMap<u64, Pending>>,
    tx: StdMutex<Option<mpsc::Sender<Frame>>>,
    next_id: AtomicU64,
    broken: StdMutex<Option<String>>,
}

impl Shared {
    fn sender(&self) -> HostResult<mpsc::Sender<Frame>> {
        match self.tx.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            Some(tx) => Ok(tx.clone()),
            None => Err(self.transport_error()),
        }
    }

    fn transport_error(&self) -> HostError {
        let broken = self.broken.lock().unwrap_or_else(|e| e.into_inner());
        HostError::other(
            broken
                .clone()
                .unwrap_or_else(|| "rpc connection closed".to_string()),
        )
    }

    async fn send(&self, frame: Frame) -> HostResult<()> {
        let tx = self.sender()?;
        tx.send(frame).await.map_err(|_| self.transport_error())
    }

    fn remove(&self, id: u64) -> Option<Pending> {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
    }

    fn insert(&self, id: u64, pending: Pending) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, pending);
    }

    /// Fail every pending call with `msg` and poison the client.
    fn fail_all(&self, msg: &str) {
        {
            let mut broken = self.broken.lock().unwrap_or_else(|e| e.into_inner());
            broken.get_or_insert_with(|| msg.to_string());
        }
        let drained: Vec<Pending> = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.drain().map(|(_, p)| p).collect()
        };
        for entry in drained {
            match entry {
                Pending::Unary(tx) => {
                    let _ = tx.send((Status::internal(msg), None));
                }
                Pending::Stream(tx) => {
                    let _ = tx.try_send(StreamEvent::Done(Status::internal(msg)));
                }
            }
        }
    }
}

/// Sends `Cancel` for an id when dropped before the call completed.
struct CancelGuard {
    shared: Arc<Shared>,
    id: u64,
    armed: bool,
}

impl CancelGuard {
    fn new(shared: Arc<Shared>, id: u64) -> Self {
        Self {
            shared,
            id,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.shared.remove(self.id);
        if let Ok(tx) = self.shared.sender() {
            let _ = tx.try_send(Frame::Cancel { id: self.id });
        }
    }
}

/// The client half of the agent RPC connection.
pub struct RpcClient {
    shared: Arc<Shared>,
    reader_task: StdMutex<Option<JoinHandle<()>>>,
    writer_task: StdMutex<Option<JoinHandle<()>>>,
}

impl RpcClient {
    /// Attach to a connection and start the reader and writer tasks.
    pub fn new(conn: PipeConn) -> Self {
        let (rd, wr) = tokio::io::split(conn);
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        let shared = Arc::new(Shared {
            pending: StdMutex::new(HashMap::new()),
            tx: StdMutex::new(Some(tx)),
            next_id: AtomicU64::new(1),
            broken: StdMutex::new(None),
        });
        let reader_task = tokio::spawn(read_loop(rd, Arc::clone(&shared)));
        let writer_task = tokio::spawn(write_loop(wr, rx));
        Self {
            shared,
            reader_task: StdMutex::new(Some(reader_task)),
            writer_task: StdMutex::new(Some(writer_task)),
        }
    }

    fn next_id(&self) -> u64 {
        self.shared.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Issue a unary call and await its reply.
    pub async fn call(&self, body: Request) -> HostResult<Option<Reply>> {
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.shared.insert(id, Pending::Unary(tx));
        let mut guard = CancelGuard::new(Arc::clone(&self.shared), id);

        self.shared.send(Frame::Request { id, body }).await?;
        let (status, reply) = match rx.await {
            Ok(answer) => answer,
            Err(_) => return Err(self.shared.transport_error()),
        };
        guard.disarm();

        if status.is_ok() {
            Ok(reply)
        } else {
            Err(status.into_error())
        }
    }

    /// Open a server-streaming read and eagerly receive the first event so
    /// open-time errors surface before any reader is handed out.
    pub async fn open_read_stream(&self, path: String) -> HostResult<ReadStream> {
        let id = self.next_id();
        let (tx, mut rx) = mpsc::channel(CHANNEL_DEPTH);
        self.shared.insert(id, Pending::Stream(tx));
        let mut guard = CancelGuard::new(Arc::clone(&self.shared), id);

        self.shared
            .send(Frame::Request {
                id,
                body: Request::ReadFile { path },
            })
            .await?;

        match rx.recv().await {
            None => Err(self.shared.transport_error()),
            Some(StreamEvent::Done(status)) if status.is_ok() => {
                guard.disarm();
                Ok(ReadStream::finished(rx))
            }
            Some(StreamEvent::Done(status)) => {
                guard.disarm();
                Err(status.into_error())
            }
            Some(StreamEvent::Data(chunk)) => Ok(ReadStream::open(chunk, rx, guard)),
        }
    }

    /// Issue a client-streaming write: metadata, chunked content from `src`,
    /// half-close, then the server's single reply.
    ///
    /// A source read error stops the transfer but still half-closes the
    /// stream; it is joined with whatever the server replies.
    pub async fn write_stream(
        &self,
        path: String,
        mode: u32,
        src: &mut (dyn AsyncRead + Send + Unpin),
    ) -> HostResult<()> {
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.shared.insert(id, Pending::Unary(tx));
        let mut guard = CancelGuard::new(Arc::clone(&self.shared), id);

        self.shared
            .send(Frame::Request {
                id,
                body: Request::WriteFile { path, mode },
            })
            .await?;

        let mut src_err = None;
        let mut buf = [0u8; WRITE_CHUNK];
        loop {
            match src.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    self.shared
                        .send(Frame::Data {
                            id,
                            chunk: buf[..n].to_vec(),
                        })
                        .await?;
                }
                Err(e) => {
                    src_err = Some(HostError::other(format!("read source: {e}")));
                    break;
                }
            }
        }
        self.shared.send(Frame::End { id }).await?;

        let (status, _) = match rx.await {
            Ok(answer) => answer,
            Err(_) => return Err(self.shared.transport_error()),
        };
        guard.disarm();

        let reply_err = if status.is_ok() {
            None
        } else {
            Some(status.into_error())
        };
        joined_result(src_err.into_iter().chain(reply_err))
    }

    /// Flush outgoing frames, half-close the connection, stop both I/O
    /// tasks, and fail anything still pending. Idempotent.
    pub async fn close(&self) {
        let tx = self
            .shared
            .tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        drop(tx);

        let writer = self
            .writer_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(writer) = writer {
            let _ = writer.await;
        }
        let reader = self
            .reader_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(reader) = reader {
            reader.abort();
            let _ = reader.await;
        }
        self.shared.fail_all("rpc client closed");
    }
}

async fn read_loop(mut rd: ReadHalf<PipeConn>, shared: Arc<Shared>) {
    loop {
        match proto::read_frame(&mut rd).await {
            Ok(Some(frame)) => route(&shared, frame).await,
            Ok(None) => {
                shared.fail_all("rpc connection closed");
                return;
            }
            Err(e) => {
                shared.fail_all(&format!("rpc transport: {e}"));
                return;
            }
        }
    }
}

async fn route(shared: &Shared, frame: Frame) {
    match frame {
        Frame::Reply { id, status, body } => match shared.remove(id) {
            Some(Pending::Unary(tx)) => {
                let _ = tx.send((status, body));
            }
            Some(Pending::Stream(tx)) => {
                let _ = tx.send(StreamEvent::Done(status)).await;
            }
            None => trace!(id, "reply for unknown call"),
        },
        Frame::Data { id, chunk } => {
            let sender = {
                let pending = shared.pending.lock().unwrap_or_else(|e| e.into_inner());
                match pending.get(&id) {
                    Some(Pending::Stream(tx)) => Some(tx.clone()),
                    _ => None,
                }
            };
            match sender {
                Some(tx) => {
                    // A failed delivery means the consumer vanished; the
                    // guard's Cancel is already on its way.
                    if tx.send(StreamEvent::Data(chunk)).await.is_err() {
                        shared.remove(id);
                    }
                }
                None => trace!(id, "chunk for unknown stream"),
            }
        }
        Frame::Request { id, .. } | Frame::End { id } | Frame::Cancel { id } => {
            warn!(id, "protocol violation: server-originated frame ignored");
        }
    }
}

async fn write_loop(mut wr: WriteHalf<PipeConn>, mut rx: mpsc::Receiver<Frame>) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = proto::write_frame(&mut wr, &frame).await {
            debug!(error = %e, "rpc write failed");
            return;
        }
    }
    // All senders gone: half-close so the peer observes EOF.
    let _ = wr.shutdown().await;
}

/// Byte stream produced by a server-streaming read.
///
/// Yields the eagerly buffered first chunk, then subsequent chunks, then
/// end-of-stream. Dropping the stream before the terminal status cancels
/// the server-side read.
pub struct ReadStream {
    buffer: Vec<u8>,
    pos: usize,
    rx: mpsc::Receiver<StreamEvent>,
    guard: Option<CancelGuard>,
    finished: bool,
}

impl ReadStream {
    fn open(first: Vec<u8>, rx: mpsc::Receiver<StreamEvent>, guard: CancelGuard) -> Self {
        Self {
            buffer: first,
            pos: 0,
            rx,
            guard: Some(guard),
            finished: false,
        }
    }

    fn finished(rx: mpsc::Receiver<StreamEvent>) -> Self {
        Self {
            buffer: Vec::new(),
            pos: 0,
            rx,
            guard: None,
            finished: true,
        }
    }
}

impl AsyncRead for ReadStream {
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
            if self.finished {
                return Poll::Ready(Ok(()));
            }
            match self.rx.poll_recv(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(StreamEvent::Data(chunk))) => {
                    self.buffer = chunk;
                    self.pos = 0;
                }
                Poll::Ready(Some(StreamEvent::Done(status))) => {
                    self.finished = true;
                    if let Some(guard) = self.guard.as_mut() {
                        guard.disarm();
                    }
                    if !status.is_ok() {
                        return Poll::Ready(Err(std::io::Error::other(
                            status.into_error().to_string(),
                        )));
                    }
                }
                Poll::Ready(None) => {
                    self.finished = true;
                    return Poll::Ready(Err(std::io::Error::other("rpc connection closed")));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{read_frame, write_frame};
    use std::time::Duration;
    use tokio::io::{DuplexStream, duplex, split};
    use tokio::time::timeout;

    fn pair() -> (
        PipeConn,
        tokio::io::ReadHalf<DuplexStream>,
        tokio::io::WriteHalf<DuplexStream>,
    ) {
        let (client_side, server_side) = duplex(64 * 1024);
        let (cr, cw) = split(client_side);
        let (sr, sw) = split(server_side);
        (PipeConn::new(Box::new(cr), Box::new(cw)), sr, sw)
    }

    #[tokio::test]
    async fn test_dropped_call_future_sends_cancel_for_its_id() {
        let (conn, mut srv_rd, _srv_wr) = pair();
        let client = RpcClient::new(conn);

        // The peer never answers, so the call future is dropped by the
        // timeout while still pending.
        let timed_out = timeout(Duration::from_millis(50), client.call(Request::Geteuid)).await;
        assert!(timed_out.is_err());

        let id = match read_frame(&mut srv_rd).await.unwrap().unwrap() {
            Frame::Request {
                id,
                body: Request::Geteuid,
            } => id,
            other => panic!("unexpected frame: {other:?}"),
        };
        match read_frame(&mut srv_rd).await.unwrap().unwrap() {
            Frame::Cancel { id: cancelled } => assert_eq!(cancelled, id),
            other => panic!("expected a cancel, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dropped_read_stream_cancels_without_touching_siblings() {
        let (conn, srv_rd, srv_wr) = pair();
        let client = RpcClient::new(conn);

        let peer = tokio::spawn(async move {
            let mut srv_rd = srv_rd;
            let mut srv_wr = srv_wr;
            let stream_id = match read_frame(&mut srv_rd).await.unwrap().unwrap() {
                Frame::Request {
                    id,
                    body: Request::ReadFile { .. },
                } => id,
                other => panic!("unexpected frame: {other:?}"),
            };
            write_frame(
                &mut srv_wr,
                &Frame::Data {
                    id: stream_id,
                    chunk: b"first chunk".to_vec(),
                },
            )
            .await
            .unwrap();

            // The stream stays open on this side; dropping the reader must
            // cancel it, naming the stream's id.
            match read_frame(&mut srv_rd).await.unwrap().unwrap() {
                Frame::Cancel { id } => assert_eq!(id, stream_id),
                other => panic!("expected a cancel, got: {other:?}"),
            }

            // A sibling call on the same connection still completes.
            match read_frame(&mut srv_rd).await.unwrap().unwrap() {
                Frame::Request {
                    id,
                    body: Request::Getegid,
                } => {
                    write_frame(
                        &mut srv_wr,
                        &Frame::Reply {
                            id,
                            status: Status::ok(),
                            body: Some(Reply::Gid(12)),
                        },
                    )
                    .await
                    .unwrap();
                }
                other => panic!("unexpected frame: {other:?}"),
            }
        });

        let stream = client
            .open_read_stream("/tmp/streamed".to_string())
            .await
            .unwrap();
        drop(stream);

        assert_eq!(
            client.call(Request::Getegid).await.unwrap(),
            Some(Reply::Gid(12))
        );
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_completed_call_sends_no_cancel() {
        let (conn, srv_rd, srv_wr) = pair();
        let client = RpcClient::new(conn);

        let peer = tokio::spawn(async move {
            let mut srv_rd = srv_rd;
            let mut srv_wr = srv_wr;
            let id = match read_frame(&mut srv_rd).await.unwrap().unwrap() {
                Frame::Request {
                    id,
                    body: Request::Geteuid,
                } => id,
                other => panic!("unexpected frame: {other:?}"),
            };
            write_frame(
                &mut srv_wr,
                &Frame::Reply {
                    id,
                    status: Status::ok(),
                    body: Some(Reply::Uid(7)),
                },
            )
            .await
            .unwrap();

            // Nothing may follow a completed call but the next request; a
            // stray cancel here means the guard fired after disarming.
            match read_frame(&mut srv_rd).await.unwrap().unwrap() {
                Frame::Request {
                    id,
                    body: Request::Getegid,
                } => {
                    write_frame(
                        &mut srv_wr,
                        &Frame::Reply {
                            id,
                            status: Status::ok(),
                            body: Some(Reply::Gid(9)),
                        },
                    )
                    .await
                    .unwrap();
                }
                other => panic!("expected the next request, got: {other:?}"),
            }
        });

        assert_eq!(
            client.call(Request::Geteuid).await.unwrap(),
            Some(Reply::Uid(7))
        );
        assert_eq!(
            client.call(Request::Getegid).await.unwrap(),
            Some(Reply::Gid(9))
        );
        peer.await.unwrap();
    }
}
