//! Privilege-escalating decorator over another run-only transport.
//!
//! Re-writes every command as `sudo -n -- sh -c '…'`, with the working
//! directory and exact environment folded into the shell body. `-n` keeps
//! the wrapper non-interactive: a password prompt becomes a failed run
//! instead of a hung one.

use async_trait::async_trait;

use crate::shell::shell_exec_command;

use super::error::{HostResult, check_absolute};
use super::types::{Cmd, WaitStatus};
use super::Runner;

/// Wraps another [`Runner`] so every command runs under sudo.
pub struct SudoRunner {
    inner: Box<dyn Runner>,
}

impl SudoRunner {
    pub fn new(inner: impl Runner + 'static) -> Self {
        Self {
            inner: Box::new(inner),
        }
    }

    fn sudo_command<'a>(cmd: &mut Cmd<'a>) -> Cmd<'a> {
        let script = shell_exec_command(
            cmd.effective_dir(),
            &cmd.effective_env(),
            &cmd.path,
            &cmd.args,
        );
        let mut sudo = Cmd::new("sudo").args(["-n", "--", "sh", "-c"]).arg(script);
        sudo.stdin = cmd.stdin.take();
        sudo.stdout = cmd.stdout.take();
        sudo.stderr = cmd.stderr.take();
        sudo
    }
}

#[async_trait]
impl Runner for SudoRunner {
    async fn run(&self, mut cmd: Cmd<'_>) -> HostResult<WaitStatus> {
        check_absolute("Run", cmd.effective_dir())?;
        let sudo = Self::sudo_command(&mut cmd);
        self.inner.run(sudo).await
    }

    async fn close(&self) -> HostResult<()> {
        self.inner.close().await
    }

    fn kind(&self) -> &'static str {
        "sudo"
    }

    fn target(&self) -> String {
        self.inner.target()
    }
}
