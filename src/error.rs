//! Error types for pairjudge.

use thiserror::Error;

/// Result type alias using the pairjudge [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that abort a match or a sandbox bootstrap.
///
/// Soft accounting failures (an unreadable usage counter) never surface here;
/// they degrade to zero inside the cgroup reader.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid or incomplete run parameters
    #[error("configuration error: {0}")]
    Config(String),

    /// Resource group directory or limit file could not be written
    #[error("cgroup error: {0}")]
    Cgroup(String),

    /// Pipe allocation failed
    #[error("pipe error: {0}")]
    Pipe(String),

    /// The sandboxed child could not be started
    #[error("spawn error: {0}")]
    Spawn(String),

    /// User namespace identity mapping failed
    #[error("namespace error: {0}")]
    Namespace(String),

    /// A mount, pivot or unmount step failed inside the sandbox
    #[error("mount error: {0}")]
    Mount(String),

    /// Dropping to the unprivileged identity failed
    #[error("privilege error: {0}")]
    Privilege(String),

    /// Replacing the bootstrap image with the payload failed
    #[error("exec error: {0}")]
    Exec(String),

    /// Bootstrap parameters missing from the environment
    #[error("bootstrap error: {0}")]
    Bootstrap(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("system error: {0}")]
    System(#[from] nix::Error),
}
