//! Single-file push over the scp "sink" protocol.
//!
//! The remote side runs `scp -t <dir>` and the pusher talks to it over the
//! channel's stdin/stdout:
//!
//! ```text
//! -> C0644 4 out.txt\n
//! <- \x00
//! -> abcd
//! -> \x00
//! <- \x00
//! ```
//!
//! Each `<-` is an acknowledgement byte: zero means continue, anything else
//! is followed by a newline-terminated message and fails the transfer.
//! Directories (`D`/`E` records) and timestamps (`T`) are not sent.

use std::fmt;
use std::path::Path;

use tokio::fs::File;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::scope::Scope;
use crate::transport::{CommandChannel, Transport};

/// Permission bits used when the platform has no Unix mode.
#[cfg(not(unix))]
const DEFAULT_MODE: u32 = 0o644;

/// The `C` record announcing one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlLine {
    /// Permission bits (only the low 12 bits are sent)
    pub mode: u32,
    /// Exact number of content bytes that follow
    pub size: u64,
    /// File name inside the receiver's target directory
    pub name: String,
}

impl fmt::Display for ControlLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "C{:04o} {} {}", self.mode & 0o7777, self.size, self.name)
    }
}

/// Split a remote path into the receiver's directory and the file name.
///
/// `remote/out.txt` gives `("remote", "out.txt")`; a bare `out.txt` gives
/// `(".", "out.txt")`. Trailing slashes are ignored.
pub fn split_remote_path(remote: &str) -> Result<(String, String)> {
    let trimmed = remote.trim_end_matches('/');

    let (dir, name) = match trimmed.rsplit_once('/') {
        Some(("", name)) => ("/", name),
        Some((dir, name)) => (dir, name),
        None => (".", trimmed),
    };

    if name.is_empty() || name == "." || name == ".." {
        return Err(Error::Config(format!(
            "remote path '{}' does not name a file",
            remote
        )));
    }

    Ok((dir.to_string(), name.to_string()))
}

/// Quote `arg` for a POSIX shell.
pub fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', "'\\''"))
}

/// Push `source` to `target` on the remote host.
///
/// Every wait on the receiver (channel open, start, both acknowledgements,
/// content writes and the exit status) is abandoned when `parent` is
/// cancelled; the channel is then closed.
///
/// # Errors
///
/// * [`Error::LocalIo`] - `source` cannot be opened or stat'ed
/// * [`Error::RemoteRejected`] - a non-zero acknowledgement, or the
///   receiver exited non-zero
/// * [`Error::Protocol`] - the receiver hung up mid-handshake, or the file
///   shrank after it was stat'ed
/// * [`Error::Cancelled`] - `parent` was cancelled first
/// * [`Error::Transport`] / [`Error::Io`] - channel failures, or a read
///   error while streaming the content
pub async fn push(
    transport: &dyn Transport,
    parent: &Scope,
    source: &Path,
    target: &str,
) -> Result<()> {
    let local_io = |source_err| Error::LocalIo {
        path: source.to_path_buf(),
        source: source_err,
    };

    let mut file = File::open(source).await.map_err(local_io)?;
    let metadata = file.metadata().await.map_err(local_io)?;

    let (dir, name) = split_remote_path(target)?;
    let header = ControlLine {
        mode: file_mode(&metadata),
        size: metadata.len(),
        name,
    };

    let scope = parent.child();
    let cancelled = scope.token();

    let CommandChannel {
        mut stdin,
        stdout,
        mut control,
        ..
    } = cancellable(cancelled, transport.open_command_channel()).await?;
    let mut stdout = BufReader::new(stdout);

    let receiver = format!("scp -t {}", shell_quote(&dir));
    debug!("Starting copy receiver: {}", receiver);

    let sent = async {
        cancellable(cancelled, control.start(&receiver)).await?;
        cancellable(
            cancelled,
            send_file(&mut stdin, &mut stdout, &mut file, &header, source),
        )
        .await?;
        cancellable(cancelled, async {
            stdin.shutdown().await.map_err(Error::from)
        })
        .await
    }
    .await;

    if let Err(e) = sent {
        warn!("Copy of {} to {} failed: {}", source.display(), target, e);
        let _ = control.close().await;
        return Err(e);
    }

    drop(stdin);
    control.close().await?;

    match cancellable(cancelled, control.wait()).await {
        // The close may race the exit status; only a reported failure counts
        Ok(()) | Err(Error::MissingExitStatus) => {
            info!(
                "Copied {} ({} bytes) to {}",
                source.display(),
                header.size,
                target
            );
            Ok(())
        }
        Err(Error::ExitStatus(code)) => Err(Error::RemoteRejected(format!(
            "scp receiver exited with status {}",
            code
        ))),
        Err(e) => Err(e),
    }
}

/// Await `operation` unless `cancelled` fires first.
async fn cancellable<T>(
    cancelled: &CancellationToken,
    operation: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;

        _ = cancelled.cancelled() => Err(Error::Cancelled("copy")),
        result = operation => result,
    }
}

/// Run the handshake and stream exactly `header.size` bytes of `file`.
async fn send_file<W, R, F>(
    stdin: &mut W,
    stdout: &mut R,
    file: &mut F,
    header: &ControlLine,
    source: &Path,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
    R: AsyncBufRead + Unpin,
    F: AsyncRead + Unpin,
{
    stdin.write_all(header.to_string().as_bytes()).await?;
    stdin.flush().await?;
    read_ack(stdout).await?;

    let mut content = file.take(header.size);
    let sent = tokio::io::copy(&mut content, stdin).await?;
    if sent < header.size {
        return Err(Error::Protocol(format!(
            "{} shrank during transfer: {} of {} bytes sent",
            source.display(),
            sent,
            header.size
        )));
    }

    stdin.write_all(&[0]).await?;
    stdin.flush().await?;
    read_ack(stdout).await
}

/// Read one acknowledgement byte; on a non-zero code, the error message
/// line that follows becomes [`Error::RemoteRejected`].
pub async fn read_ack<R>(reader: &mut R) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut code = [0u8; 1];
    if let Err(e) = reader.read_exact(&mut code).await {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            return Err(Error::Protocol(
                "receiver closed the stream before acknowledging".to_string(),
            ));
        }
        return Err(e.into());
    }

    if code[0] == 0 {
        return Ok(());
    }

    let mut message = Vec::new();
    reader.read_until(b'\n', &mut message).await?;
    let message = String::from_utf8_lossy(&message).trim_end().to_string();

    Err(Error::RemoteRejected(message))
}

#[cfg(unix)]
fn file_mode(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(_metadata: &std::fs::Metadata) -> u32 {
    DEFAULT_MODE
}
