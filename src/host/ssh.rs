//! SSH endpoint as a run-only transport.
//!
//! Relays commands through the system `ssh` client in batch mode, streaming
//! stdin/stdout/stderr through the SSH channel. The remote command line is
//! assembled with [`crate::shell::shell_exec_command`], which resets the
//! remote environment to exactly the command's environment; a missing
//! `PATH` on the remote is therefore only a problem for commands that rely
//! on the default environment being richer than [`super::DEFAULT_ENV`].

use async_trait::async_trait;

use crate::shell::shell_exec_command;

use super::error::{HostResult, check_absolute};
use super::local::LocalHost;
use super::types::{Cmd, WaitStatus};
use super::Runner;

/// Runs commands on `destination` (`host` or `user@host`) via the system
/// `ssh` client.
pub struct SshRunner {
    destination: String,
    port: Option<u16>,
    local: LocalHost,
}

impl SshRunner {
    pub fn new(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            port: None,
            local: LocalHost::new(),
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    fn ssh_command<'a>(&self, cmd: &mut Cmd<'a>) -> Cmd<'a> {
        let remote = shell_exec_command(
            cmd.effective_dir(),
            &cmd.effective_env(),
            &cmd.path,
            &cmd.args,
        );
        let mut ssh = Cmd::new("ssh").args(["-o", "BatchMode=yes"]);
        if let Some(port) = self.port {
            ssh = ssh.arg("-p").arg(port.to_string());
        }
        ssh = ssh.arg("--").arg(&self.destination).arg(remote);
        ssh.stdin = cmd.stdin.take();
        ssh.stdout = cmd.stdout.take();
        ssh.stderr = cmd.stderr.take();
        ssh
    }
}

#[async_trait]
impl Runner for SshRunner {
    /// The wait status is the remote command's. `ssh` reports its own
    /// connection failures as exit code 255, which is indistinguishable
    /// from a remote command exiting 255.
    async fn run(&self, mut cmd: Cmd<'_>) -> HostResult<WaitStatus> {
        check_absolute("Run", cmd.effective_dir())?;
        let ssh = self.ssh_command(&mut cmd);
        self.local.run_cmd(ssh).await
    }

    async fn close(&self) -> HostResult<()> {
        // Each run is its own ssh process; there is no persistent channel.
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "ssh"
    }

    fn target(&self) -> String {
        self.destination.clone()
    }
}
