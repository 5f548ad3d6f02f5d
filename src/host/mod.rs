//! The host capability contract and its transports.
//!
//! A [`Host`] exposes POSIX-style filesystem and process operations against
//! some target machine: the local one ([`LocalHost`]), a transport that can
//! only run commands wrapped in shell utilities ([`ShellHost`]), or a remote
//! agent process driven over RPC ([`crate::agent::AgentHost`]).
//!
//! Every path argument must be absolute; operations reject relative paths
//! locally with [`HostError::PathNotAbsolute`], before any transport work.
//! Cancellation is drop-based: dropping a pending call future or a
//! [`FileReader`] abandons the underlying work.

mod docker;
mod error;
mod fallback;
mod local;
mod ssh;
mod sudo;
mod types;

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, ReadBuf};

pub use docker::DockerRunner;
pub use error::{HostError, HostResult, check_absolute, join_errors, joined_result};
pub use fallback::ShellHost;
pub use local::LocalHost;
pub use ssh::SshRunner;
pub use sudo::SudoRunner;
pub use types::{
    Cmd, DEFAULT_DIR, DEFAULT_ENV, DirEnt, Group, InputStream, OutputBuffer, OutputStream, Stat,
    Timespec, User, WaitStatus,
};

/// The full host capability interface.
///
/// A `Host` owns its transport resources; [`Host::close`] releases them and
/// is idempotent. Hosts are passed by reference, never cloned.
#[async_trait]
pub trait Host: Send + Sync {
    /// Set the full POSIX mode bits (suid/sgid/sticky + rwx) of `path`.
    async fn chmod(&self, path: &str, mode: u32) -> HostResult<()>;

    async fn chown(&self, path: &str, uid: u32, gid: u32) -> HostResult<()>;

    /// Resolve a username; [`HostError::UnknownUser`] when absent.
    async fn lookup(&self, username: &str) -> HostResult<User>;

    /// Resolve a group name; [`HostError::UnknownGroup`] when absent.
    async fn lookup_group(&self, name: &str) -> HostResult<Group>;

    /// Stat without following symlinks.
    async fn lstat(&self, path: &str) -> HostResult<Stat>;

    /// List a directory, excluding `.` and `..`. Order is unspecified.
    async fn read_dir(&self, path: &str) -> HostResult<Vec<DirEnt>>;

    /// Create exactly one directory and apply `mode` explicitly afterwards,
    /// defeating the umask.
    async fn mkdir(&self, path: &str, mode: u32) -> HostResult<()>;

    /// Open `path` for streaming reads. Open-time errors (permission,
    /// not-exist) surface here, before a reader is returned.
    async fn read_file(&self, path: &str) -> HostResult<FileReader>;

    /// Stream `src` into `path`, then apply `mode` explicitly.
    async fn write_file(
        &self,
        path: &str,
        src: &mut (dyn AsyncRead + Send + Unpin),
        mode: u32,
    ) -> HostResult<()>;

    /// Create a symlink at `newname` recording `oldname` verbatim. Only
    /// `newname` must be absolute.
    async fn symlink(&self, oldname: &str, newname: &str) -> HostResult<()>;

    async fn read_link(&self, path: &str) -> HostResult<String>;

    /// Remove a file, or an empty directory.
    async fn remove(&self, path: &str) -> HostResult<()>;

    /// Create a filesystem node. Device bits in `mode` require privilege.
    async fn mknod(&self, path: &str, mode: u32, dev: u64) -> HostResult<()>;

    /// Execute a command, streaming stdin/stdout/stderr through the caller's
    /// readers and writers when provided.
    async fn run(&self, cmd: Cmd<'_>) -> HostResult<WaitStatus>;

    async fn geteuid(&self) -> HostResult<u32>;

    async fn getegid(&self) -> HostResult<u32>;

    /// Release transport resources. Idempotent; always safe to call.
    async fn close(&self) -> HostResult<()>;

    /// Short transport tag, e.g. `localhost`, `ssh`, `docker`, `agent`.
    fn kind(&self) -> &'static str;

    /// Human-readable connection target.
    fn target(&self) -> String;
}

/// A transport that can only execute commands.
///
/// This is the seam the agent bootstrap and the cmd-over-shell fallback
/// build on: anything that can `run` (the local machine, an SSH endpoint, a
/// Docker container, a sudo wrapper) can carry a full [`Host`].
#[async_trait]
pub trait Runner: Send + Sync {
    /// Execute `cmd` to completion, honoring its attached streams.
    async fn run(&self, cmd: Cmd<'_>) -> HostResult<WaitStatus>;

    /// Release transport resources. Idempotent.
    async fn close(&self) -> HostResult<()>;

    /// Short transport tag.
    fn kind(&self) -> &'static str;

    /// Human-readable connection target.
    fn target(&self) -> String;
}

/// Future returned by a [`FileReader`] close hook.
pub type CloseFuture = Pin<Box<dyn Future<Output = HostResult<()>> + Send>>;

/// Streaming file contents returned by [`Host::read_file`].
///
/// Reads yield the file bytes in order. Dropping the reader cancels the
/// producer; [`FileReader::close`] additionally awaits the producer's
/// terminal status and reports any residual error.
pub struct FileReader {
    inner: Box<dyn AsyncRead + Send + Unpin>,
    closer: Option<Box<dyn FnOnce() -> CloseFuture + Send>>,
}

impl FileReader {
    /// A reader whose producer needs a terminal join on close.
    pub fn with_closer(
        inner: Box<dyn AsyncRead + Send + Unpin>,
        closer: Box<dyn FnOnce() -> CloseFuture + Send>,
    ) -> Self {
        Self {
            inner,
            closer: Some(closer),
        }
    }

    /// A reader that is fully torn down by dropping it.
    pub fn plain(inner: Box<dyn AsyncRead + Send + Unpin>) -> Self {
        Self {
            inner,
            closer: None,
        }
    }

    /// Stop reading and join the producer's terminal status.
    pub async fn close(mut self) -> HostResult<()> {
        let closer = self.closer.take();
        drop(self.inner);
        match closer {
            Some(closer) => closer().await,
            None => Ok(()),
        }
    }
}

impl AsyncRead for FileReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

/// Run `cmd` on `runner` with stdout and stderr captured into buffers.
pub async fn run_capture(
    runner: &dyn Runner,
    mut cmd: Cmd<'_>,
) -> HostResult<(WaitStatus, Vec<u8>, Vec<u8>)> {
    let stdout = OutputBuffer::new();
    let stderr = OutputBuffer::new();
    cmd.stdout = Some(stdout.writer());
    cmd.stderr = Some(stderr.writer());
    let status = runner.run(cmd).await?;
    Ok((status, stdout.take(), stderr.take()))
}
