//! Remote command execution with a hard deadline.
//!
//! [`run`] opens a command channel and starts the command, then fans in
//! four event sources on a single accumulating loop:
//!
//! 1. the deadline,
//! 2. a line from the stdout reader task,
//! 3. a line from the stderr reader task,
//! 4. a reader task reporting that it finished (or failed).
//!
//! Both streams are drained by their own task so a command blocked on a
//! full stderr pipe cannot stall while stdout sits idle. Once both readers
//! have finished, the loop waits for the exit status against the *same*
//! deadline: a command can close its output and still never exit (an
//! orphaned background job holding the channel open).
//!
//! On timeout the accumulated output is discarded and
//! [`Error::Timeout`] is returned. Every task spawned for the call lives in
//! a [`Scope`] derived from the caller's, so returning (for any reason) or
//! closing the connection stops all of them.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::scope::Scope;
use crate::transport::{BoxedReader, CommandChannel, Transport};

/// Lines buffered per stream before a reader waits for the accumulator.
const LINE_QUEUE_DEPTH: usize = 64;

/// Output of a command that completed within its deadline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Standard output, line terminators preserved
    pub stdout: String,

    /// Standard error, line terminators preserved
    pub stderr: String,
}

impl CommandOutput {
    /// stdout followed by stderr.
    pub fn combined_output(&self) -> String {
        let mut combined = String::with_capacity(self.stdout.len() + self.stderr.len());
        combined.push_str(&self.stdout);
        combined.push_str(&self.stderr);
        combined
    }
}

/// Run `command` over a new channel of `transport`.
///
/// The deadline covers opening the channel, starting the command, draining
/// both output streams and waiting for the exit status.
///
/// # Errors
///
/// * [`Error::Timeout`] - the deadline elapsed first; no output is returned
/// * [`Error::ExitStatus`] / [`Error::MissingExitStatus`] - the command
///   did not exit cleanly
/// * [`Error::Transport`] / [`Error::Io`] - opening, starting or reading failed
/// * [`Error::Cancelled`] - `parent` was cancelled first
pub async fn run(
    transport: &dyn Transport,
    parent: &Scope,
    command: &str,
    timeout: Duration,
) -> Result<CommandOutput> {
    let deadline = Instant::now() + timeout;
    let mut scope = parent.child();

    let result = execute(transport, &scope, command, deadline, timeout).await;

    for err in scope.shutdown().await {
        debug!("Command teardown error for '{}': {}", command, err);
    }

    match &result {
        Ok(output) => debug!(
            "Command completed: stdout_len={}, stderr_len={}",
            output.stdout.len(),
            output.stderr.len()
        ),
        Err(e) if e.is_timeout() => warn!("Command timed out after {:?}: {}", timeout, command),
        Err(e) => debug!("Command failed: {}: {}", command, e),
    }

    result
}

async fn execute(
    transport: &dyn Transport,
    scope: &Scope,
    command: &str,
    deadline: Instant,
    timeout: Duration,
) -> Result<CommandOutput> {
    let cancelled = scope.token().clone();

    let CommandChannel {
        mut stdin,
        stdout,
        stderr,
        mut control,
    } = race(deadline, &cancelled, timeout, transport.open_command_channel()).await?;

    if let Err(e) = race(deadline, &cancelled, timeout, control.start(command)).await {
        let _ = control.close().await;
        return Err(e);
    }

    // The command gets no input; EOF lets `cat`-like commands finish. A
    // failed shutdown only means the remote stopped reading.
    let stdin_closed = race(deadline, &cancelled, timeout, async {
        stdin.shutdown().await.map_err(Error::from)
    })
    .await;
    match stdin_closed {
        Ok(()) => {}
        Err(Error::Io(e)) => debug!("Ignoring stdin shutdown failure: {}", e),
        Err(e) => {
            let _ = control.close().await;
            return Err(e);
        }
    }

    let (stdout_tx, mut stdout_rx) = mpsc::channel(LINE_QUEUE_DEPTH);
    let (stderr_tx, mut stderr_rx) = mpsc::channel(LINE_QUEUE_DEPTH);
    let (finished_tx, mut finished_rx) = mpsc::channel::<Result<()>>(2);

    for (reader, lines) in [(stdout, stdout_tx), (stderr, stderr_tx)] {
        let finished = finished_tx.clone();
        let token = cancelled.clone();
        scope.spawn(async move {
            let result = tokio::select! {
                _ = token.cancelled() => return Ok(()),
                result = forward_lines(reader, lines) => result,
            };
            let _ = finished.send(result).await;
            Ok(())
        });
    }
    drop(finished_tx);

    // Waits for the exit status; on cancellation it closes the channel so
    // the remote side learns nobody is listening any more.
    let (exit_tx, mut exit_rx) = oneshot::channel();
    let token = cancelled.clone();
    scope.spawn(async move {
        tokio::select! {
            result = control.wait() => {
                let _ = exit_tx.send(result);
            }
            _ = token.cancelled() => {}
        }
        control.close().await
    });

    let mut output = CommandOutput::default();
    let mut running_readers = 2;

    while running_readers > 0 {
        // Order matters: the deadline wins every tie, and queued lines are
        // taken before a reader's "finished" so none are lost.
        tokio::select! {
            biased;

            _ = tokio::time::sleep_until(deadline) => return Err(Error::Timeout(timeout)),
            _ = cancelled.cancelled() => return Err(cancelled_error()),
            Some(line) = stdout_rx.recv() => output.stdout.push_str(&line),
            Some(line) = stderr_rx.recv() => output.stderr.push_str(&line),
            Some(finished) = finished_rx.recv() => {
                finished?;
                running_readers -= 1;
            }
        }
    }

    tokio::select! {
        biased;

        _ = tokio::time::sleep_until(deadline) => Err(Error::Timeout(timeout)),
        _ = cancelled.cancelled() => Err(cancelled_error()),
        exit = &mut exit_rx => {
            exit.map_err(|_| Error::MissingExitStatus)??;
            Ok(output)
        }
    }
}

/// Await `operation` unless the deadline or cancellation comes first.
async fn race<T>(
    deadline: Instant,
    cancelled: &CancellationToken,
    timeout: Duration,
    operation: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;

        _ = tokio::time::sleep_until(deadline) => Err(Error::Timeout(timeout)),
        _ = cancelled.cancelled() => Err(cancelled_error()),
        result = operation => result,
    }
}

fn cancelled_error() -> Error {
    Error::Cancelled("command")
}

/// Send each line of `reader` (terminator included) to `lines` until EOF.
///
/// A final line without a terminator is sent as-is. Invalid UTF-8 is
/// replaced rather than failing the command.
async fn forward_lines(reader: BoxedReader, lines: mpsc::Sender<String>) -> Result<()> {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            return Ok(());
        }
        let line = String::from_utf8_lossy(&buf).into_owned();
        if lines.send(line).await.is_err() {
            // Accumulator is gone; nothing left to do
            return Ok(());
        }
    }
}
