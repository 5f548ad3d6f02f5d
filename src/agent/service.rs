//! Machine-side implementation of the agent protocol.
//!
//! Each protocol operation maps onto the corresponding OS primitive through
//! [`LocalHost`], which already enforces absolute paths as a defense in
//! depth against buggy clients.

use std::io::Cursor;

use tokio::io::AsyncRead;

use crate::host::{Cmd, FileReader, Host, HostError, HostResult, LocalHost, OutputBuffer};
use crate::proto::{Reply, Request, Status};

pub(crate) struct AgentService {
    local: LocalHost,
}

impl AgentService {
    pub(crate) fn new() -> Self {
        Self {
            local: LocalHost::new(),
        }
    }

    /// Handle a unary request, normalizing the outcome into a wire status.
    pub(crate) async fn dispatch(&self, req: Request) -> (Status, Option<Reply>) {
        match self.handle(req).await {
            Ok(reply) => (Status::ok(), reply),
            Err(e) => (Status::from_error(&e), None),
        }
    }

    async fn handle(&self, req: Request) -> HostResult<Option<Reply>> {
        match req {
            Request::Ping => Ok(Some(Reply::Ping {
                message: "Pong".to_string(),
            })),
            Request::Chmod { path, mode } => {
                self.local.chmod(&path, mode).await?;
                Ok(None)
            }
            Request::Chown { path, uid, gid } => {
                self.local.chown(&path, uid, gid).await?;
                Ok(None)
            }
            Request::Lookup { username } => {
                Ok(Some(Reply::User(self.local.lookup(&username).await?)))
            }
            Request::LookupGroup { name } => {
                Ok(Some(Reply::Group(self.local.lookup_group(&name).await?)))
            }
            Request::Lstat { path } => Ok(Some(Reply::Stat(self.local.lstat(&path).await?))),
            Request::ReadDir { path } => {
                Ok(Some(Reply::DirEnts(self.local.read_dir(&path).await?)))
            }
            Request::Mkdir { path, mode } => {
                self.local.mkdir(&path, mode).await?;
                Ok(None)
            }
            Request::Symlink { oldname, newname } => {
                self.local.symlink(&oldname, &newname).await?;
                Ok(None)
            }
            Request::ReadLink { path } => Ok(Some(Reply::Link {
                target: self.local.read_link(&path).await?,
            })),
            Request::Remove { path } => {
                self.local.remove(&path).await?;
                Ok(None)
            }
            Request::Mknod { path, mode, dev } => {
                self.local.mknod(&path, mode, dev).await?;
                Ok(None)
            }
            Request::Run {
                path,
                args,
                env,
                dir,
                stdin,
            } => self.run(path, args, env, dir, stdin).await,
            Request::Geteuid => Ok(Some(Reply::Uid(self.local.geteuid().await?))),
            Request::Getegid => Ok(Some(Reply::Gid(self.local.getegid().await?))),
            // Routed by the serve loop before dispatch.
            Request::Shutdown | Request::ReadFile { .. } | Request::WriteFile { .. } => Err(
                HostError::other(format!("{} is not a unary operation", req.op())),
            ),
        }
    }

    async fn run(
        &self,
        path: String,
        args: Vec<String>,
        env: Option<Vec<String>>,
        dir: Option<String>,
        stdin: Vec<u8>,
    ) -> HostResult<Option<Reply>> {
        let stdout = OutputBuffer::new();
        let stderr = OutputBuffer::new();
        let mut cmd = Cmd::new(path).args(args);
        cmd.env = env;
        cmd.dir = dir;
        if !stdin.is_empty() {
            cmd.stdin = Some(Box::new(Cursor::new(stdin)));
        }
        cmd.stdout = Some(stdout.writer());
        cmd.stderr = Some(stderr.writer());
        let status = self.local.run_cmd(cmd).await?;
        Ok(Some(Reply::Run {
            status,
            stdout: stdout.take(),
            stderr: stderr.take(),
        }))
    }

    /// Open a file for server-streaming reads; open-time errors surface
    /// here, before any chunk is sent.
    pub(crate) async fn open_read(&self, path: &str) -> HostResult<FileReader> {
        self.local.read_file(path).await
    }

    /// Stream `src` into `path`, applying `mode` after the final chunk.
    pub(crate) async fn write_file(
        &self,
        path: &str,
        src: &mut (dyn AsyncRead + Send + Unpin),
        mode: u32,
    ) -> HostResult<()> {
        self.local.write_file(path, src, mode).await
    }
}
