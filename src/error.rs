//! Error types for sshit.
//!
//! # Taxonomy
//!
//! - [`Error::Timeout`]: the command runner's deadline elapsed.
//! - [`Error::Transport`] / [`Error::Io`]: opening a channel, starting a
//!   command, dialing, or moving bytes failed for a reason other than an
//!   intentional cancellation.
//! - [`Error::LocalIo`]: the local file being pushed could not be opened,
//!   stat'ed or read.
//! - [`Error::RemoteRejected`]: the copy receiver answered with a non-zero
//!   acknowledgement or exited non-zero.
//! - [`Error::NotConnected`]: an operation needs a live transport and there
//!   is none.
//! - [`Error::Cancelled`]: the client was closed while a command or copy
//!   was still running.
//!
//! # Closed resources
//!
//! Tearing a tunnel down closes sockets that other tasks are still blocked
//! on. Those tasks then observe one of the "closed" I/O error kinds matched
//! by [`is_closed_io`]. Callers suppress such errors only when the owning
//! scope has already been cancelled; otherwise they are real failures.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Main error type for sshit.
#[derive(Debug, Error)]
pub enum Error {
    /// Deadline elapsed before the operation completed
    #[error("i/o timeout after {0:?}")]
    Timeout(Duration),

    /// Channel or stream failure reported by the SSH layer
    #[error("transport error: {0}")]
    Transport(String),

    /// Stream-level I/O failure on a channel or forwarded connection
    #[error("transport i/o error: {0}")]
    Io(#[from] io::Error),

    /// Local filesystem failure while pushing a file
    #[error("local i/o error on {}: {source}", path.display())]
    LocalIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The remote copy receiver refused the transfer
    #[error("remote rejected transfer: {0}")]
    RemoteRejected(String),

    /// The copy receiver broke the wire protocol
    #[error("protocol error: {0}")]
    Protocol(String),

    /// No live connection to operate on
    #[error("not connected")]
    NotConnected,

    /// Establishing the SSH connection failed
    #[error("SSH connection error: {0}")]
    Connect(String),

    /// Authentication failed (password, key, or agent)
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The remote command exited with a non-zero status
    #[error("remote command exited with status {0}")]
    ExitStatus(u32),

    /// The remote command finished without reporting an exit status
    #[error("remote command exited without exit status")]
    MissingExitStatus,

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Config(String),

    /// The owning scope was cancelled while the operation was in progress
    #[error("{0} cancelled: connection is closing")]
    Cancelled(&'static str),

    /// A background task panicked
    #[error("background task panicked: {0}")]
    Panicked(String),
}

/// Result type alias using [`Error`]
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a transport error from a context and an underlying error.
    pub fn transport(context: &str, err: impl std::fmt::Display) -> Self {
        Error::Transport(format!("{}: {}", context, err))
    }

    /// Whether this is the command runner's deadline error.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }
}

/// Matches the I/O error kinds produced by reading from or writing to a
/// socket or channel that has been closed underneath the caller.
pub fn is_closed_io(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}
