//! Agent bootstrap: detect, stage, spawn, handshake, supervise.
//!
//! The bootstrap needs nothing from its transport beyond command execution:
//! `uname -m` for architecture detection, `mktemp`/`chmod` for staging, and
//! `sh -c 'cat > …'` with the gunzipped binary piped as stdin for the
//! upload. The spawned agent is then driven entirely over its stdio.

use std::io::Cursor;
use std::io::Read;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, error, warn};

use crate::host::{Cmd, Host, HostError, HostResult, Runner, join_errors, run_capture};
use crate::pipe::PipeConn;
use crate::rpc::RpcClient;
use crate::shell::shell_quote;

use super::client::AgentHost;
use super::registry::{self, Arch};

/// Template handed to `mktemp -t` for the staged binary.
const AGENT_TEMPLATE: &str = "resonance_agent.XXXXXXXX";

/// In-memory pipe capacity between the RPC stack and the child's stdio.
const PIPE_BUF: usize = 64 * 1024;

impl AgentHost {
    /// Bootstrap an agent on the machine behind `runner`.
    ///
    /// On success the ready handshake has completed and the agent is
    /// usable. On any failure after the spawn, the pipes are closed, the
    /// supervisor is awaited, and the causes are joined into one error.
    ///
    /// Failures before the spawn may leave the staged temp file behind;
    /// the success path relies on the agent unlinking itself instead.
    pub async fn spawn(runner: Box<dyn Runner>) -> HostResult<AgentHost> {
        let runner: Arc<dyn Runner> = Arc::from(runner);

        let arch = detect_arch(&*runner).await?;
        let key = registry::key("linux", arch);
        let compressed = registry::lookup(&key).ok_or_else(|| {
            HostError::other(format!("unsupported OS/arch {key}: no embedded agent binary"))
        })?;
        let binary = gunzip(compressed)?;

        let remote_path = make_temp(&*runner).await?;
        debug!(host = %runner.target(), path = %remote_path, arch = %arch, "staging agent");
        stage(&*runner, &remote_path, binary).await?;

        let host = start(Arc::clone(&runner), remote_path);
        match host.ping().await {
            Ok(()) => Ok(host),
            Err(ping_err) => {
                warn!(error = %ping_err, "agent handshake failed, tearing down");
                let close_err = Host::close(&host).await.err();
                Err(join_errors(std::iter::once(ping_err).chain(close_err))
                    .unwrap_or(HostError::Other("agent handshake failed".to_string())))
            }
        }
    }
}

/// Spawn the staged binary with its stdio attached to in-memory pipes, the
/// stderr pump running, and the supervisor reporting the terminal status
/// through a single-use channel.
fn start(runner: Arc<dyn Runner>, remote_path: String) -> AgentHost {
    let (stdin_writer, stdin_reader) = tokio::io::duplex(PIPE_BUF);
    let (stdout_writer, stdout_reader) = tokio::io::duplex(PIPE_BUF);
    let (stderr_writer, stderr_reader) = tokio::io::duplex(PIPE_BUF);

    let cmd = Cmd::new(&remote_path)
        .stdin(Box::new(stdin_reader))
        .stdout(Box::new(stdout_writer))
        .stderr(Box::new(stderr_writer));

    let (done_tx, done_rx) = oneshot::channel();
    let supervisor_runner = Arc::clone(&runner);
    let supervisor_target = runner.target();
    tokio::spawn(async move {
        let result = supervisor_runner.run(cmd).await;
        if let Err(e) = &result {
            warn!(host = %supervisor_target, error = %e, "agent process failed");
        }
        let _ = done_tx.send(result);
    });
    tokio::spawn(pump_stderr(stderr_reader, runner.target()));

    let conn = PipeConn::new(Box::new(stdout_reader), Box::new(stdin_writer));
    let client = RpcClient::new(conn);

    AgentHost {
        runner,
        remote_path,
        client,
        supervisor: Mutex::new(Some(done_rx)),
        closed: AtomicBool::new(false),
    }
}

/// One ERROR record per line of agent stderr, so remote misconfiguration
/// shows up in the local diagnostics.
async fn pump_stderr(stderr: impl AsyncRead + Unpin, target: String) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => error!(target: "agent", host = %target, "{line}"),
            Ok(None) => return,
            Err(e) => {
                debug!(error = %e, "agent stderr pump ended");
                return;
            }
        }
    }
}

/// Run a bootstrap step, expecting success; failures carry the command
/// line, the wait status, and the captured stderr.
async fn run_checked(
    runner: &dyn Runner,
    step: &'static str,
    cmd: Cmd<'_>,
) -> HostResult<Vec<u8>> {
    let line = cmd.command_line();
    let (status, stdout, stderr) = run_capture(runner, cmd).await?;
    if status.success() {
        Ok(stdout)
    } else {
        Err(HostError::other(format!(
            "{step}: {line}: {status}: {}",
            String::from_utf8_lossy(&stderr).trim()
        )))
    }
}

async fn detect_arch(runner: &dyn Runner) -> HostResult<Arch> {
    let out = run_checked(runner, "detect architecture", Cmd::new("uname").arg("-m")).await?;
    let machine = String::from_utf8_lossy(&out).trim().to_string();
    Arch::from_uname(&machine)
        .ok_or_else(|| HostError::other(format!("unsupported architecture: {machine}")))
}

async fn make_temp(runner: &dyn Runner) -> HostResult<String> {
    let out = run_checked(
        runner,
        "create temp file",
        Cmd::new("mktemp").arg("-t").arg(AGENT_TEMPLATE),
    )
    .await?;
    let path = String::from_utf8_lossy(&out).trim().to_string();
    if path.is_empty() {
        return Err(HostError::other("create temp file: mktemp printed nothing"));
    }
    Ok(path)
}

async fn stage(runner: &dyn Runner, path: &str, binary: Vec<u8>) -> HostResult<()> {
    run_checked(
        runner,
        "mark agent executable",
        Cmd::new("chmod").arg("0755").arg(path),
    )
    .await?;
    let receiver = format!("cat > {}", shell_quote(path));
    let cmd = Cmd::new("sh")
        .args(["-c", receiver.as_str()])
        .stdin(Box::new(Cursor::new(binary)));
    run_checked(runner, "stage agent binary", cmd).await?;
    Ok(())
}

fn gunzip(compressed: &[u8]) -> HostResult<Vec<u8>> {
    let mut binary = Vec::new();
    flate2::read::GzDecoder::new(compressed)
        .read_to_end(&mut binary)
        .map_err(|e| HostError::other(format!("gunzip agent binary: {e}")))?;
    Ok(binary)
}
