//! Docker container as a run-only transport.
//!
//! Relays commands through `docker exec -i`, streaming stdin/stdout/stderr.
//! The connection string is `container` or `user@container`; without a
//! `user@` prefix commands run as `0:0`.

use async_trait::async_trait;

use super::error::{HostResult, check_absolute};
use super::local::LocalHost;
use super::types::{Cmd, WaitStatus};
use super::Runner;

/// Runs commands inside a container via the `docker` client.
pub struct DockerRunner {
    user: String,
    container: String,
    local: LocalHost,
}

impl DockerRunner {
    pub fn new(connection: &str) -> Self {
        let (user, container) = match connection.split_once('@') {
            Some((user, container)) => (user.to_string(), container.to_string()),
            None => ("0:0".to_string(), connection.to_string()),
        };
        Self {
            user,
            container,
            local: LocalHost::new(),
        }
    }

    fn exec_command<'a>(&self, cmd: &mut Cmd<'a>) -> Cmd<'a> {
        let mut exec = Cmd::new("docker")
            .arg("exec")
            .args(["--user", &self.user])
            .arg("-i")
            .args(["--workdir", cmd.effective_dir()]);
        for kv in cmd.effective_env() {
            exec = exec.arg("--env").arg(kv);
        }
        exec = exec.arg(&self.container).arg(&cmd.path).args(cmd.args.clone());
        exec.stdin = cmd.stdin.take();
        exec.stdout = cmd.stdout.take();
        exec.stderr = cmd.stderr.take();
        exec
    }
}

#[async_trait]
impl Runner for DockerRunner {
    async fn run(&self, mut cmd: Cmd<'_>) -> HostResult<WaitStatus> {
        check_absolute("Run", cmd.effective_dir())?;
        let exec = self.exec_command(&mut cmd);
        self.local.run_cmd(exec).await
    }

    async fn close(&self) -> HostResult<()> {
        // Each run is its own docker client process.
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "docker"
    }

    fn target(&self) -> String {
        format!("{}@{}", self.user, self.container)
    }
}
