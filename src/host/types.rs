//! Value types shared by the host contract and the agent wire protocol.
//!
//! All integer widths are fixed here once and reused verbatim on the wire:
//! mode/uid/gid are unsigned 32-bit, dev/rdev/ino/nlink unsigned 64-bit,
//! size/blksize/blocks signed 64-bit, times signed 64-bit second/nanosecond
//! pairs.

use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

/// Working directory used when a [`Cmd`] does not set one.
pub const DEFAULT_DIR: &str = "/tmp";

/// Minimal environment used when a [`Cmd`] does not set one.
pub const DEFAULT_ENV: &[&str] = &[
    "LANG=en_US.UTF-8",
    "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin",
];

/// Owned byte source attached to a command's stdin.
pub type InputStream<'a> = Box<dyn AsyncRead + Send + Unpin + 'a>;

/// Owned byte sink attached to a command's stdout or stderr.
pub type OutputStream<'a> = Box<dyn AsyncWrite + Send + Unpin + 'a>;

/// A command to execute on a host.
///
/// `path` is a program name or absolute path. An unset `env` means the
/// [`DEFAULT_ENV`] minimal environment; an unset `dir` means [`DEFAULT_DIR`].
/// When set, `dir` must be absolute. Absent streams are discarded (stdin) or
/// captured/discarded at the transport's discretion (stdout, stderr).
pub struct Cmd<'a> {
    pub path: String,
    pub args: Vec<String>,
    pub env: Option<Vec<String>>,
    pub dir: Option<String>,
    pub stdin: Option<InputStream<'a>>,
    pub stdout: Option<OutputStream<'a>>,
    pub stderr: Option<OutputStream<'a>>,
}

impl<'a> Cmd<'a> {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            args: Vec::new(),
            env: None,
            dir: None,
            stdin: None,
            stdout: None,
            stderr: None,
        }
    }

    /// Add a single argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add multiple arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Replace the environment with explicit `KEY=VALUE` entries.
    pub fn envs<I, S>(mut self, env: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.env = Some(env.into_iter().map(Into::into).collect());
        self
    }

    /// Set the working directory. Must be absolute.
    pub fn dir(mut self, dir: impl Into<String>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    pub fn stdin(mut self, stdin: InputStream<'a>) -> Self {
        self.stdin = Some(stdin);
        self
    }

    pub fn stdout(mut self, stdout: OutputStream<'a>) -> Self {
        self.stdout = Some(stdout);
        self
    }

    pub fn stderr(mut self, stderr: OutputStream<'a>) -> Self {
        self.stderr = Some(stderr);
        self
    }

    /// The working directory with the default applied.
    pub fn effective_dir(&self) -> &str {
        self.dir.as_deref().unwrap_or(DEFAULT_DIR)
    }

    /// The environment with the default applied.
    pub fn effective_env(&self) -> Vec<String> {
        match &self.env {
            Some(env) => env.clone(),
            None => DEFAULT_ENV.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// The command line for log records.
    pub fn command_line(&self) -> String {
        let mut parts = vec![self.path.clone()];
        parts.extend(self.args.iter().cloned());
        crate::shell::shell_join(parts)
    }
}

impl fmt::Debug for Cmd<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cmd")
            .field("path", &self.path)
            .field("args", &self.args)
            .field("env", &self.env)
            .field("dir", &self.dir)
            .field("stdin", &self.stdin.is_some())
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .finish()
    }
}

/// Terminal status of a finished process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitStatus {
    pub exit_code: i32,
    pub exited: bool,
    /// Textual signal name (e.g. `SIGKILL`) when the process was killed by a
    /// signal; empty otherwise.
    pub signal: String,
}

impl WaitStatus {
    pub fn success(&self) -> bool {
        self.exited && self.exit_code == 0 && self.signal.is_empty()
    }
}

impl fmt::Display for WaitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.exited {
            write!(f, "exited({})", self.exit_code)
        } else {
            write!(f, "signaled({})", self.signal)
        }
    }
}

impl From<std::process::ExitStatus> for WaitStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        match status.code() {
            Some(code) => WaitStatus {
                exit_code: code,
                exited: true,
                signal: String::new(),
            },
            None => WaitStatus {
                exit_code: -1,
                exited: false,
                signal: status.signal().map(signal_name).unwrap_or_default(),
            },
        }
    }
}

fn signal_name(sig: i32) -> String {
    nix::sys::signal::Signal::try_from(sig)
        .map(|s| s.as_str().to_string())
        .unwrap_or_else(|_| format!("signal {sig}"))
}

/// Second/nanosecond timestamp pair, as in `struct timespec`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timespec {
    pub sec: i64,
    pub nsec: i64,
}

/// POSIX `lstat` mirror. `mode` carries both the file-type bits and the
/// permission bits, as on Linux.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stat {
    pub dev: u64,
    pub ino: u64,
    pub nlink: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub size: i64,
    pub blksize: i64,
    pub blocks: i64,
    pub atim: Timespec,
    pub mtim: Timespec,
    pub ctim: Timespec,
}

impl Stat {
    /// The `S_IFMT` file-type bits.
    pub fn file_type(&self) -> u32 {
        self.mode & libc::S_IFMT
    }

    /// The permission bits, including suid/sgid/sticky.
    pub fn permissions(&self) -> u32 {
        self.mode & 0o7777
    }

    pub fn is_dir(&self) -> bool {
        self.file_type() == libc::S_IFDIR
    }

    pub fn is_symlink(&self) -> bool {
        self.file_type() == libc::S_IFLNK
    }
}

/// A directory entry. `kind` uses the kernel `DT_*` encoding and `name` is
/// the basename only, never `.` or `..`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEnt {
    pub ino: u64,
    pub kind: u8,
    pub name: String,
}

/// A user database entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub uid: u32,
    pub gid: u32,
    pub username: String,
    /// Full name (GECOS field); may be empty.
    pub name: String,
    pub home: String,
}

/// A group database entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub gid: u32,
    pub name: String,
}

/// A clonable in-memory sink for capturing a command's stdout or stderr.
#[derive(Clone, Default)]
pub struct OutputBuffer(Arc<Mutex<Vec<u8>>>);

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A writer handle appending into this buffer.
    pub fn writer(&self) -> OutputStream<'static> {
        Box::new(BufferWriter(Arc::clone(&self.0)))
    }

    /// Take the accumulated bytes, leaving the buffer empty.
    pub fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.lock())
    }

    /// The accumulated bytes decoded lossily as UTF-8.
    pub fn utf8_lossy(&self) -> String {
        String::from_utf8_lossy(&self.lock()).into_owned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<u8>> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct BufferWriter(Arc<Mutex<Vec<u8>>>);

impl AsyncWrite for BufferWriter {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(buf);
        std::task::Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cmd_defaults() {
        let cmd = Cmd::new("ls");
        assert_eq!(cmd.effective_dir(), "/tmp");
        assert!(
            cmd.effective_env()
                .iter()
                .any(|kv| kv.starts_with("PATH="))
        );
    }

    #[test]
    fn test_cmd_builder() {
        let cmd = Cmd::new("ls").arg("-l").dir("/var").envs(["FOO=1"]);
        assert_eq!(cmd.args, vec!["-l"]);
        assert_eq!(cmd.effective_dir(), "/var");
        assert_eq!(cmd.effective_env(), vec!["FOO=1"]);
    }

    #[test]
    fn test_cmd_command_line_quotes() {
        let cmd = Cmd::new("sh").arg("-c").arg("cat > x");
        assert_eq!(cmd.command_line(), "sh -c 'cat > x'");
    }

    #[test]
    fn test_wait_status_success() {
        let ok = WaitStatus {
            exit_code: 0,
            exited: true,
            signal: String::new(),
        };
        assert!(ok.success());
        let failed = WaitStatus {
            exit_code: 2,
            ..ok.clone()
        };
        assert!(!failed.success());
        let killed = WaitStatus {
            exit_code: -1,
            exited: false,
            signal: "SIGKILL".to_string(),
        };
        assert!(!killed.success());
    }

    #[test]
    fn test_stat_helpers() {
        let stat = Stat {
            mode: libc::S_IFLNK | 0o777,
            ..Stat::default()
        };
        assert!(stat.is_symlink());
        assert!(!stat.is_dir());
        assert_eq!(stat.permissions(), 0o777);
    }

    #[tokio::test]
    async fn test_output_buffer_captures_writes() {
        use tokio::io::AsyncWriteExt;
        let buf = OutputBuffer::new();
        let mut w = buf.writer();
        w.write_all(b"hello").await.unwrap();
        assert_eq!(buf.take(), b"hello");
        assert!(buf.take().is_empty());
    }
}
