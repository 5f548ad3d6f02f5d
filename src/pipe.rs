//! Pipe-as-connection shim.
//!
//! The agent's transport is a pair of OS pipes (the child's stdin and
//! stdout), not a socket. [`PipeConn`] presents an owned reader/writer pair
//! as a single reliable, ordered, full-duplex byte connection, and
//! [`PipeListener`] yields that connection exactly once, which is the shape
//! a connection-oriented server loop expects.
//!
//! Address queries return opaque `pipe://` identifiers suitable only for
//! logging. There is no deadline API: the underlying channel does not
//! support deadlines, and timeouts are the caller's `tokio::time` concern.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::Mutex;

/// A full-duplex connection over an owned `(reader, writer)` pair.
pub struct PipeConn {
    reader: Option<Box<dyn AsyncRead + Send + Unpin>>,
    writer: Option<Box<dyn AsyncWrite + Send + Unpin>>,
}

impl PipeConn {
    pub fn new(
        reader: Box<dyn AsyncRead + Send + Unpin>,
        writer: Box<dyn AsyncWrite + Send + Unpin>,
    ) -> Self {
        Self {
            reader: Some(reader),
            writer: Some(writer),
        }
    }

    /// Opaque local identifier, for logging only.
    pub fn local_addr(&self) -> &'static str {
        "pipe://local"
    }

    /// Opaque remote identifier, for logging only.
    pub fn peer_addr(&self) -> &'static str {
        "pipe://remote"
    }

    /// Shut down the writer and drop the reader. Idempotent.
    ///
    /// The reader side carries no close error of its own; the writer's
    /// shutdown error, if any, is the result.
    pub async fn close(&mut self) -> io::Result<()> {
        self.reader.take();
        match self.writer.take() {
            Some(mut writer) => writer.shutdown().await,
            None => Ok(()),
        }
    }
}

impl AsyncRead for PipeConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.reader.as_mut() {
            // Closed connection reads as end-of-stream.
            None => Poll::Ready(Ok(())),
            Some(reader) => Pin::new(reader).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for PipeConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.writer.as_mut() {
            None => Poll::Ready(Err(io::Error::from(io::ErrorKind::BrokenPipe))),
            Some(writer) => Pin::new(writer).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.writer.as_mut() {
            None => Poll::Ready(Ok(())),
            Some(writer) => Pin::new(writer).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.writer.as_mut() {
            None => Poll::Ready(Ok(())),
            Some(writer) => Pin::new(writer).poll_shutdown(cx),
        }
    }
}

/// A listener that yields its connection exactly once.
///
/// The listener owns the connection until accepted. Every accept after the
/// first, and every accept after [`PipeListener::close`], reports
/// end-of-stream as `None`.
pub struct PipeListener {
    conn: Mutex<Option<PipeConn>>,
}

impl PipeListener {
    pub fn single(conn: PipeConn) -> Self {
        Self {
            conn: Mutex::new(Some(conn)),
        }
    }

    pub async fn accept(&self) -> Option<PipeConn> {
        self.conn.lock().await.take()
    }

    pub async fn close(&self) {
        self.conn.lock().await.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, duplex, split};

    fn conn_pair() -> (PipeConn, PipeConn) {
        let (a, b) = duplex(256);
        let (ar, aw) = split(a);
        let (br, bw) = split(b);
        (
            PipeConn::new(Box::new(ar), Box::new(aw)),
            PipeConn::new(Box::new(br), Box::new(bw)),
        )
    }

    #[tokio::test]
    async fn test_forwards_reads_and_writes() {
        let (mut a, mut b) = conn_pair();
        a.write_all(b"ping").await.unwrap();
        a.flush().await.unwrap();
        let mut buf = [0u8; 4];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        b.write_all(b"pong").await.unwrap();
        b.flush().await.unwrap();
        a.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_signals_eof() {
        let (mut a, mut b) = conn_pair();
        a.close().await.unwrap();
        a.close().await.unwrap();

        // The peer observes end-of-stream.
        let mut buf = Vec::new();
        b.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());

        // Reads on the closed side report EOF; writes report broken pipe.
        let n = a.read(&mut [0u8; 8]).await.unwrap();
        assert_eq!(n, 0);
        assert!(a.write_all(b"x").await.is_err());
    }

    #[tokio::test]
    async fn test_listener_yields_exactly_once() {
        let (a, _b) = conn_pair();
        let listener = PipeListener::single(a);
        assert!(listener.accept().await.is_some());
        assert!(listener.accept().await.is_none());
    }

    #[tokio::test]
    async fn test_listener_close_drops_connection() {
        let (a, _b) = conn_pair();
        let listener = PipeListener::single(a);
        listener.close().await;
        assert!(listener.accept().await.is_none());
    }

    #[tokio::test]
    async fn test_addrs_are_opaque() {
        let (a, _b) = conn_pair();
        assert!(a.local_addr().starts_with("pipe://"));
        assert!(a.peer_addr().starts_with("pipe://"));
    }
}
