//! The agent entry point.
//!
//! Runs on the target machine with no arguments, speaking the RPC protocol
//! over stdin/stdout. Diagnostics go to stderr, where the client's pump
//! turns them into log records on the controlling side.

use anyhow::{Context, Result};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

fn main() -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(false)
                .with_target(false),
        )
        .try_init()
        .map_err(|e| anyhow::anyhow!("initialize tracing subscriber: {e}"))?;

    // A closing transport must not kill the process mid-shutdown.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    // Leave nothing staged behind, however this process ends.
    resonance_host::agent::server::unlink_self();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;
    runtime.block_on(resonance_host::agent::server::serve_stdio())
}
