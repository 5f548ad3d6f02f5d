//! The agent transport.
//!
//! An agent is a self-contained binary staged onto a target machine through
//! any [`crate::host::Runner`] and executed with its stdio as the RPC
//! transport. [`AgentHost::spawn`] performs the bootstrap (architecture
//! detection, staging, spawn, ready handshake); the resulting [`AgentHost`]
//! implements the full host contract with native syscall performance on
//! the far side.

mod bootstrap;
mod client;
pub mod registry;
pub mod server;
mod service;

pub use client::AgentHost;
pub use registry::Arch;
