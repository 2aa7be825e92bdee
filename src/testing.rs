//! In-memory transport for unit tests.
//!
//! [`FakeTransport`] hands out command channels backed by
//! `tokio::io::duplex` pipes. When a command is started, the transport's
//! script runs on a separate task with the remote ends of those pipes, so
//! each test decides what the "remote" command prints, reads and returns.
//! Dialing connects to a real TCP endpoint (usually an [`echo_server`]).

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::transport::{
    BoxedReader, BoxedWriter, ChannelControl, CommandChannel, ForwardStream, Transport,
};

type Script = Arc<dyn Fn(FakeRemote) -> BoxFuture<'static, ()> + Send + Sync>;

/// The remote side of one command channel.
pub(crate) struct FakeRemote {
    pub command: String,
    pub stdin: DuplexStream,
    pub stdout: DuplexStream,
    pub stderr: DuplexStream,
    exit: Option<oneshot::Sender<Option<u32>>>,
}

impl FakeRemote {
    /// Report the exit status. Dropping the remote without calling this
    /// means the command ended without a status.
    pub fn exit(&mut self, code: u32) {
        if let Some(tx) = self.exit.take() {
            let _ = tx.send(Some(code));
        }
    }

    /// Hand out the exit reporter so the script can keep it alive.
    pub fn take_exit(&mut self) -> Option<oneshot::Sender<Option<u32>>> {
        self.exit.take()
    }
}

/// How the local stdin writer behaves when the runner shuts it down.
#[derive(Clone, Copy)]
pub(crate) enum StdinShutdown {
    Fails,
    Hangs,
}

pub(crate) struct FakeTransport {
    script: Script,
    pipe_capacity: usize,
    start_error: Option<String>,
    start_delay: Option<Duration>,
    stdout_error: Option<String>,
    stdin_shutdown: Option<StdinShutdown>,
    dial_error: Option<String>,
    corrupt_dial: bool,
    channels_closed: Arc<AtomicUsize>,
    closed: AtomicBool,
}

impl FakeTransport {
    pub fn new<F, Fut>(script: F) -> Self
    where
        F: Fn(FakeRemote) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            script: Arc::new(move |remote| Box::pin(script(remote))),
            pipe_capacity: 64 * 1024,
            start_error: None,
            start_delay: None,
            stdout_error: None,
            stdin_shutdown: None,
            dial_error: None,
            corrupt_dial: false,
            channels_closed: Arc::new(AtomicUsize::new(0)),
            closed: AtomicBool::new(false),
        }
    }

    /// A transport whose commands do nothing and exit 0.
    pub fn idle() -> Self {
        Self::new(|mut remote| async move { remote.exit(0) })
    }

    pub fn with_pipe_capacity(mut self, capacity: usize) -> Self {
        self.pipe_capacity = capacity;
        self
    }

    pub fn with_start_error(mut self, message: &str) -> Self {
        self.start_error = Some(message.to_string());
        self
    }

    /// `start` succeeds only after `delay`.
    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = Some(delay);
        self
    }

    /// The local stdout reader fails with `message` on its first read.
    pub fn with_stdout_error(mut self, message: &str) -> Self {
        self.stdout_error = Some(message.to_string());
        self
    }

    pub fn with_stdin_shutdown(mut self, behaviour: StdinShutdown) -> Self {
        self.stdin_shutdown = Some(behaviour);
        self
    }

    pub fn with_dial_error(mut self, message: &str) -> Self {
        self.dial_error = Some(message.to_string());
        self
    }

    /// Dialed streams swallow writes and fail every read with `InvalidData`.
    pub fn with_corrupt_dial(mut self) -> Self {
        self.corrupt_dial = true;
        self
    }

    /// Number of `ChannelControl::close` calls so far.
    pub fn channels_closed(&self) -> usize {
        self.channels_closed.load(Ordering::SeqCst)
    }
}

struct FakeControl {
    script: Script,
    remote: Option<FakeRemote>,
    exit: Option<oneshot::Receiver<Option<u32>>>,
    start_error: Option<String>,
    start_delay: Option<Duration>,
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl ChannelControl for FakeControl {
    async fn start(&mut self, command: &str) -> Result<()> {
        if let Some(message) = self.start_error.take() {
            return Err(Error::Transport(message));
        }
        if let Some(delay) = self.start_delay {
            tokio::time::sleep(delay).await;
        }
        let mut remote = self
            .remote
            .take()
            .ok_or_else(|| Error::Transport("command already started".to_string()))?;
        remote.command = command.to_string();
        tokio::spawn((self.script)(remote));
        Ok(())
    }

    async fn wait(&mut self) -> Result<()> {
        let exit = self
            .exit
            .take()
            .ok_or_else(|| Error::Transport("exit status already consumed".to_string()))?;
        match exit.await {
            Ok(Some(0)) => Ok(()),
            Ok(Some(code)) => Err(Error::ExitStatus(code)),
            Ok(None) | Err(_) => Err(Error::MissingExitStatus),
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.remote = None;
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn open_command_channel(&self) -> Result<CommandChannel> {
        if self.is_closed() {
            return Err(Error::NotConnected);
        }

        let (stdin, remote_stdin) = tokio::io::duplex(self.pipe_capacity);
        let (stdout, remote_stdout) = tokio::io::duplex(self.pipe_capacity);
        let (stderr, remote_stderr) = tokio::io::duplex(self.pipe_capacity);
        let (exit_tx, exit_rx) = oneshot::channel();

        let remote = FakeRemote {
            command: String::new(),
            stdin: remote_stdin,
            stdout: remote_stdout,
            stderr: remote_stderr,
            exit: Some(exit_tx),
        };

        let stdin: BoxedWriter = match self.stdin_shutdown {
            Some(behaviour) => Box::new(ScriptedStdin { inner: stdin, behaviour }),
            None => Box::new(stdin),
        };
        let stdout: BoxedReader = match &self.stdout_error {
            Some(message) => Box::new(FailingReader {
                kind: io::ErrorKind::Other,
                message: message.clone(),
            }),
            None => Box::new(stdout),
        };

        Ok(CommandChannel {
            stdin,
            stdout,
            stderr: Box::new(stderr),
            control: Box::new(FakeControl {
                script: self.script.clone(),
                remote: Some(remote),
                exit: Some(exit_rx),
                start_error: self.start_error.clone(),
                start_delay: self.start_delay,
                closed: self.channels_closed.clone(),
            }),
        })
    }

    async fn dial(&self, remote: &Endpoint) -> Result<ForwardStream> {
        if let Some(message) = &self.dial_error {
            return Err(Error::Transport(message.clone()));
        }
        if self.corrupt_dial {
            return Ok(Box::new(CorruptStream));
        }
        let stream = TcpStream::connect(remote.address())
            .await
            .map_err(|e| Error::transport(&format!("Failed to dial {}", remote), e))?;
        Ok(Box::new(stream))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Reader whose every read fails.
struct FailingReader {
    kind: io::ErrorKind,
    message: String,
}

impl AsyncRead for FailingReader {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Ready(Err(io::Error::new(self.kind, self.message.clone())))
    }
}

/// Stdin pipe whose shutdown fails or never completes.
struct ScriptedStdin {
    inner: DuplexStream,
    behaviour: StdinShutdown,
}

impl AsyncWrite for ScriptedStdin {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.behaviour {
            StdinShutdown::Fails => Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
            StdinShutdown::Hangs => Poll::Pending,
        }
    }
}

/// Dialed stream that accepts every write and fails every read.
struct CorruptStream;

impl AsyncRead for CorruptStream {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Ready(Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "corrupt frame from remote",
        )))
    }
}

impl AsyncWrite for CorruptStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Start a TCP server on an OS-assigned port that echoes every connection.
pub(crate) async fn echo_server() -> Endpoint {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
                let _ = writer.shutdown().await;
            });
        }
    });

    Endpoint::new("127.0.0.1", port)
}

/// Minimal copy receiver: acknowledges the control line and the content,
/// then returns what it received once stdin reaches EOF.
pub(crate) async fn scp_receiver(remote: &mut FakeRemote) -> (String, Vec<u8>) {
    let mut header = Vec::new();
    let mut byte = [0u8; 1];
    while remote.stdin.read_exact(&mut byte).await.is_ok() && byte[0] != b'\n' {
        header.push(byte[0]);
    }
    let header = String::from_utf8_lossy(&header).into_owned();
    let size: usize = header
        .split(' ')
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    remote.stdout.write_all(&[0]).await.unwrap();

    let mut content = vec![0u8; size];
    remote.stdin.read_exact(&mut content).await.unwrap();
    remote.stdin.read_exact(&mut byte).await.unwrap();
    assert_eq!(byte[0], 0, "transfer must end with a zero byte");
    remote.stdout.write_all(&[0]).await.unwrap();

    let mut rest = Vec::new();
    remote.stdin.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty(), "nothing may follow the end marker");

    (header, content)
}
