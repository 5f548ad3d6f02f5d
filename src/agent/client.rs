//! Host implementation backed by a remote agent process.
//!
//! Every operation marshals into the corresponding RPC; path validation
//! happens locally, before anything touches the transport. Transport
//! failures surface as [`HostError::Other`] with the original message.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, error};

use crate::host::{
    Cmd, DirEnt, FileReader, Group, Host, HostError, HostResult, Runner, Stat, User, WaitStatus,
    check_absolute, joined_result,
};
use crate::proto::{Reply, Request};
use crate::rpc::RpcClient;

/// A live agent on some target machine.
///
/// Created by [`AgentHost::spawn`]; usable only after the ready handshake
/// that `spawn` performs. [`Host::close`] shuts the agent down, reaps its
/// process through the supervisor channel, and closes the underlying
/// transport.
pub struct AgentHost {
    pub(super) runner: Arc<dyn Runner>,
    pub(super) remote_path: String,
    pub(super) client: RpcClient,
    pub(super) supervisor: Mutex<Option<oneshot::Receiver<HostResult<WaitStatus>>>>,
    pub(super) closed: AtomicBool,
}

impl AgentHost {
    /// The staged binary path on the target, for diagnostics.
    pub fn remote_path(&self) -> &str {
        &self.remote_path
    }

    /// The ready handshake: `Ping` must answer exactly `"Pong"`.
    pub(super) async fn ping(&self) -> HostResult<()> {
        match self.client.call(Request::Ping).await? {
            Some(Reply::Ping { message }) if message == "Pong" => Ok(()),
            Some(Reply::Ping { message }) => Err(HostError::other(format!(
                "unexpected handshake reply: {message:?}"
            ))),
            _ => Err(HostError::other("unexpected handshake reply payload")),
        }
    }

    fn unexpected(op: &'static str) -> HostError {
        HostError::other(format!("{op}: unexpected reply payload"))
    }

    /// Issue a call whose reply carries no payload.
    async fn call_unit(&self, req: Request) -> HostResult<()> {
        self.client.call(req).await.map(|_| ())
    }
}

#[async_trait]
impl Host for AgentHost {
    async fn chmod(&self, path: &str, mode: u32) -> HostResult<()> {
        check_absolute("Chmod", path)?;
        self.call_unit(Request::Chmod {
            path: path.to_string(),
            mode,
        })
        .await
    }

    async fn chown(&self, path: &str, uid: u32, gid: u32) -> HostResult<()> {
        check_absolute("Chown", path)?;
        self.call_unit(Request::Chown {
            path: path.to_string(),
            uid,
            gid,
        })
        .await
    }

    async fn lookup(&self, username: &str) -> HostResult<User> {
        match self
            .client
            .call(Request::Lookup {
                username: username.to_string(),
            })
            .await?
        {
            Some(Reply::User(user)) => Ok(user),
            _ => Err(Self::unexpected("Lookup")),
        }
    }

    async fn lookup_group(&self, name: &str) -> HostResult<Group> {
        match self
            .client
            .call(Request::LookupGroup {
                name: name.to_string(),
            })
            .await?
        {
            Some(Reply::Group(group)) => Ok(group),
            _ => Err(Self::unexpected("LookupGroup")),
        }
    }

    async fn lstat(&self, path: &str) -> HostResult<Stat> {
        check_absolute("Lstat", path)?;
        match self
            .client
            .call(Request::Lstat {
                path: path.to_string(),
            })
            .await?
        {
            Some(Reply::Stat(stat)) => Ok(stat),
            _ => Err(Self::unexpected("Lstat")),
        }
    }

    async fn read_dir(&self, path: &str) -> HostResult<Vec<DirEnt>> {
        check_absolute("ReadDir", path)?;
        match self
            .client
            .call(Request::ReadDir {
                path: path.to_string(),
            })
            .await?
        {
            Some(Reply::DirEnts(entries)) => Ok(entries),
            _ => Err(Self::unexpected("ReadDir")),
        }
    }

    async fn mkdir(&self, path: &str, mode: u32) -> HostResult<()> {
        check_absolute("Mkdir", path)?;
        self.call_unit(Request::Mkdir {
            path: path.to_string(),
            mode,
        })
        .await
    }

    async fn read_file(&self, path: &str) -> HostResult<FileReader> {
        check_absolute("ReadFile", path)?;
        let stream = self.client.open_read_stream(path.to_string()).await?;
        Ok(FileReader::plain(Box::new(stream)))
    }

    async fn write_file(
        &self,
        path: &str,
        src: &mut (dyn AsyncRead + Send + Unpin),
        mode: u32,
    ) -> HostResult<()> {
        check_absolute("WriteFile", path)?;
        self.client.write_stream(path.to_string(), mode, src).await
    }

    async fn symlink(&self, oldname: &str, newname: &str) -> HostResult<()> {
        check_absolute("Symlink", newname)?;
        self.call_unit(Request::Symlink {
            oldname: oldname.to_string(),
            newname: newname.to_string(),
        })
        .await
    }

    async fn read_link(&self, path: &str) -> HostResult<String> {
        check_absolute("ReadLink", path)?;
        match self
            .client
            .call(Request::ReadLink {
                path: path.to_string(),
            })
            .await?
        {
            Some(Reply::Link { target }) => Ok(target),
            _ => Err(Self::unexpected("ReadLink")),
        }
    }

    async fn remove(&self, path: &str) -> HostResult<()> {
        check_absolute("Remove", path)?;
        self.call_unit(Request::Remove {
            path: path.to_string(),
        })
        .await
    }

    async fn mknod(&self, path: &str, mode: u32, dev: u64) -> HostResult<()> {
        check_absolute("Mknod", path)?;
        self.call_unit(Request::Mknod {
            path: path.to_string(),
            mode,
            dev,
        })
        .await
    }

    /// Caller stdin is drained into a buffer before the request goes out;
    /// reply stdout/stderr are copied into the caller's writers afterwards.
    /// Commands with unbounded output should pipe through files instead.
    async fn run(&self, mut cmd: Cmd<'_>) -> HostResult<WaitStatus> {
        let mut stdin = Vec::new();
        if let Some(mut src) = cmd.stdin.take() {
            src.read_to_end(&mut stdin)
                .await
                .map_err(|e| HostError::other(format!("drain stdin: {e}")))?;
        }
        let reply = self
            .client
            .call(Request::Run {
                path: cmd.path.clone(),
                args: cmd.args.clone(),
                env: cmd.env.clone(),
                dir: cmd.dir.clone(),
                stdin,
            })
            .await?;
        match reply {
            Some(Reply::Run {
                status,
                stdout,
                stderr,
            }) => {
                if let Some(mut sink) = cmd.stdout.take() {
                    sink.write_all(&stdout)
                        .await
                        .map_err(|e| HostError::other(format!("copy stdout: {e}")))?;
                    sink.flush()
                        .await
                        .map_err(|e| HostError::other(format!("copy stdout: {e}")))?;
                }
                if let Some(mut sink) = cmd.stderr.take() {
                    sink.write_all(&stderr)
                        .await
                        .map_err(|e| HostError::other(format!("copy stderr: {e}")))?;
                    sink.flush()
                        .await
                        .map_err(|e| HostError::other(format!("copy stderr: {e}")))?;
                }
                Ok(status)
            }
            _ => Err(Self::unexpected("Run")),
        }
    }

    async fn geteuid(&self) -> HostResult<u32> {
        match self.client.call(Request::Geteuid).await? {
            Some(Reply::Uid(uid)) => Ok(uid),
            _ => Err(Self::unexpected("Geteuid")),
        }
    }

    async fn getegid(&self) -> HostResult<u32> {
        match self.client.call(Request::Getegid).await? {
            Some(Reply::Gid(gid)) => Ok(gid),
            _ => Err(Self::unexpected("Getegid")),
        }
    }

    /// Shutdown RPC → supervisor join → RPC channel close → transport
    /// close, with every error joined rather than swallowed.
    async fn close(&self) -> HostResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!(host = %self.runner.target(), "closing agent");
        let mut errs = Vec::new();

        if let Err(e) = self.client.call(Request::Shutdown).await {
            // The server may never have seen the request; close the pipes so
            // it observes EOF instead of waiting on stdin forever.
            self.client.close().await;
            errs.push(e);
        }

        let supervisor = self.supervisor.lock().await.take();
        match supervisor {
            Some(rx) => match rx.await {
                Ok(Ok(status)) => {
                    if !status.success() {
                        error!(status = %status, "agent process exited with failure");
                    }
                }
                Ok(Err(e)) => errs.push(e),
                Err(_) => errs.push(HostError::other("agent supervisor vanished")),
            },
            None => {}
        }

        self.client.close().await;
        if let Err(e) = self.runner.close().await {
            errs.push(e);
        }
        joined_result(errs)
    }

    fn kind(&self) -> &'static str {
        "agent"
    }

    fn target(&self) -> String {
        self.runner.target()
    }
}
