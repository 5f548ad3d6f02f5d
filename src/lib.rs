//! Remote host abstraction for the resonance configuration engine.
//!
//! The [`host::Host`] trait exposes POSIX-style filesystem and process
//! operations (chmod, chown, lstat, readdir, mkdir, readfile, writefile,
//! symlink, readlink, remove, mknod, run, geteuid, getegid) against one of
//! several transports:
//!
//! - [`host::LocalHost`] — the local machine, via direct syscalls;
//! - [`host::ShellHost`] — any transport that can merely run commands
//!   (SSH, Docker, sudo, or the local machine), emulated with POSIX
//!   utilities;
//! - [`agent::AgentHost`] — a helper binary copied onto the target and
//!   driven over its stdin/stdout with a multiplexed RPC protocol.
//!
//! The agent is the interesting transport: [`agent::AgentHost::spawn`]
//! bootstraps it using nothing but command execution, then every operation
//! runs as a native syscall on the far side, with streaming file transfer,
//! structured errors, and a clean shutdown handshake.

pub mod agent;
pub mod host;
pub mod pipe;
pub mod proto;
pub mod rpc;
pub mod shell;
