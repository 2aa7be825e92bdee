//! The transport seam.
//!
//! Everything above this module talks to an already-authenticated
//! connection through the [`Transport`] trait. It can open command channels
//! (one remote command with its stdin/stdout/stderr and exit status) and
//! dial raw byte streams to a host and port on the remote side.
//! [`crate::session::SshTransport`] is the russh-backed implementation.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::endpoint::Endpoint;
use crate::error::Result;

/// Readable half of a command channel (stdout or stderr).
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Writable half of a command channel (stdin).
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Object-safe bound for a bidirectional forwarded stream.
pub trait ForwardStreamIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> ForwardStreamIo for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// A raw byte stream dialed through the transport.
pub type ForwardStream = Box<dyn ForwardStreamIo>;

/// Lifecycle operations of a command channel.
#[async_trait]
pub trait ChannelControl: Send {
    /// Start `command` on the channel.
    async fn start(&mut self, command: &str) -> Result<()>;

    /// Wait for the remote command to exit.
    ///
    /// Returns `Err(Error::ExitStatus(code))` for a non-zero status and
    /// `Err(Error::MissingExitStatus)` when the channel ended without one.
    async fn wait(&mut self) -> Result<()>;

    /// Close the channel. Closing an already closed channel succeeds.
    async fn close(&mut self) -> Result<()>;
}

/// One remote command's streams plus its control handle.
pub struct CommandChannel {
    pub stdin: BoxedWriter,
    pub stdout: BoxedReader,
    pub stderr: BoxedReader,
    pub control: Box<dyn ChannelControl>,
}

/// An authenticated connection shared by commands, copies and tunnels.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a new command channel.
    async fn open_command_channel(&self) -> Result<CommandChannel>;

    /// Open a raw stream to `remote` as seen from the server.
    async fn dial(&self, remote: &Endpoint) -> Result<ForwardStream>;

    /// Whether the underlying connection has gone away.
    fn is_closed(&self) -> bool;

    /// Tear down the connection.
    async fn disconnect(&self) -> Result<()>;
}
