//! Canonical error taxonomy shared by every host implementation.
//!
//! Native OS errors, shell utility stderr, and agent wire statuses are all
//! normalized into [`HostError`] at the boundary where they occur, so
//! downstream code compares by kind and never by message text.

use std::io;

/// Result alias used across the crate.
pub type HostResult<T> = Result<T, HostError>;

/// The error kinds every host operation may surface.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HostError {
    /// A path argument was not absolute. Raised locally, before any
    /// transport or syscall work happens.
    #[error("{op} {path}: path must be absolute")]
    PathNotAbsolute { op: &'static str, path: String },
    #[error("file does not exist")]
    NotExist,
    #[error("file already exists")]
    Exist,
    #[error("permission denied")]
    PermissionDenied,
    #[error("user: unknown user {0}")]
    UnknownUser(String),
    #[error("group: unknown group {0}")]
    UnknownGroup(String),
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    /// Everything else: transport failures, unclassified OS errors, protocol
    /// violations. The message is preserved end to end.
    #[error("{0}")]
    Other(String),
}

impl HostError {
    /// Shorthand for an [`HostError::Other`] with a formatted message.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }
}

/// Validate that `path` is absolute, naming the operation in the error.
pub fn check_absolute(op: &'static str, path: &str) -> HostResult<()> {
    if path.starts_with('/') {
        Ok(())
    } else {
        Err(HostError::PathNotAbsolute {
            op,
            path: path.to_string(),
        })
    }
}

impl From<io::Error> for HostError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => HostError::NotExist,
            io::ErrorKind::AlreadyExists => HostError::Exist,
            io::ErrorKind::PermissionDenied => HostError::PermissionDenied,
            io::ErrorKind::NotADirectory => HostError::NotADirectory,
            io::ErrorKind::IsADirectory => HostError::IsADirectory,
            _ => HostError::Other(err.to_string()),
        }
    }
}

impl From<nix::Error> for HostError {
    fn from(errno: nix::Error) -> Self {
        match errno {
            nix::Error::ENOENT => HostError::NotExist,
            nix::Error::EEXIST => HostError::Exist,
            nix::Error::EACCES | nix::Error::EPERM => HostError::PermissionDenied,
            nix::Error::ENOTDIR => HostError::NotADirectory,
            nix::Error::EISDIR => HostError::IsADirectory,
            _ => HostError::Other(errno.desc().to_string()),
        }
    }
}

/// Combine zero or more errors into one.
///
/// Returns `None` when the iterator is empty, the error itself when there is
/// exactly one (its kind preserved), and an [`HostError::Other`] with all
/// messages when there are several. Used on teardown paths where every step
/// runs regardless of earlier failures.
pub fn join_errors<I>(errs: I) -> Option<HostError>
where
    I: IntoIterator<Item = HostError>,
{
    let mut errs: Vec<HostError> = errs.into_iter().collect();
    match errs.len() {
        0 => None,
        1 => Some(errs.remove(0)),
        _ => Some(HostError::Other(
            errs.iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("; "),
        )),
    }
}

/// Like [`join_errors`] but folds into a `Result`, for teardown sequences
/// that must report success only when every step succeeded.
pub fn joined_result<I>(errs: I) -> HostResult<()>
where
    I: IntoIterator<Item = HostError>,
{
    match join_errors(errs) {
        None => Ok(()),
        Some(e) => Err(e),
    }
}
