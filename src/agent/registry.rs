//! Process-wide registry of embedded agent binaries.
//!
//! The embedding application installs its gzip-compressed, statically built
//! agent binaries once at startup; the registry is read-only afterwards.
//! Keys are `os.arch` (e.g. `linux.amd64`) matching the build matrix.

use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;

use crate::host::{HostError, HostResult};

/// Architectures the agent ships for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    X86,
    Amd64,
    Arm,
    Arm64,
}

impl Arch {
    /// Map `uname -m` output to an agent architecture.
    pub fn from_uname(machine: &str) -> Option<Self> {
        match machine {
            "i386" | "i486" | "i586" | "i686" => Some(Arch::X86),
            "x86_64" => Some(Arch::Amd64),
            "armv6l" | "armv7l" => Some(Arch::Arm),
            "aarch64" => Some(Arch::Arm64),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Arch::X86 => "386",
            Arch::Amd64 => "amd64",
            Arch::Arm => "arm",
            Arch::Arm64 => "arm64",
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registry key for an OS/architecture pair.
pub fn key(os: &str, arch: Arch) -> String {
    format!("{os}.{arch}")
}

static REGISTRY: OnceLock<HashMap<String, Vec<u8>>> = OnceLock::new();

/// Install the gzip-compressed agent binaries. Callable once per process.
pub fn init(binaries: HashMap<String, Vec<u8>>) -> HostResult<()> {
    REGISTRY
        .set(binaries)
        .map_err(|_| HostError::other("agent binary registry already initialized"))
}

/// The gzip-compressed agent binary registered for `key`, if any.
pub fn lookup(key: &str) -> Option<&'static [u8]> {
    REGISTRY.get().and_then(|m| m.get(key)).map(Vec::as_slice)
}
