//! russh-backed transport.
//!
//! [`SshTransport`] owns an authenticated `client::Handle` and implements
//! [`Transport`] on top of it:
//!
//! - **Command channels** are `session` channels split into read and write
//!   halves. A pump task drains the read half and routes each message:
//!   `Data` to stdout, `ExtendedData` with code 1 to stderr, `ExitStatus` to
//!   the exit waiter. Output goes through unbounded queues so a stream
//!   nobody reads never stalls the other one.
//! - **Dialed streams** are `direct-tcpip` channels (RFC 4254) turned into
//!   `AsyncRead + AsyncWrite` with `into_stream`.
//!
//! Host keys are accepted without verification, like
//! `StrictHostKeyChecking=no` in OpenSSH.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use russh::{ChannelMsg, ChannelReadHalf, ChannelWriteHalf, Disconnect, client, keys};
use tokio::sync::{mpsc, oneshot};
use tokio_util::io::StreamReader;
use tracing::{debug, info};

use crate::auth::{AuthChain, AuthMethod};
use crate::config::ClientConfig;
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::transport::{BoxedReader, ChannelControl, CommandChannel, ForwardStream, Transport};

/// SSH extended data type code for stderr
const SSH_EXTENDED_DATA_STDERR: u32 = 1;

/// Client handler for russh that accepts all host keys.
pub struct SshClientHandler;

impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &keys::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Build russh client configuration.
///
/// The inactivity timeout is disabled so idle tunnels stay open; liveness
/// is checked with keepalives every 30 seconds (3 misses drop the session).
pub(crate) fn build_client_config(compress: bool) -> Arc<client::Config> {
    let compression = if compress {
        (&[russh::compression::ZLIB, russh::compression::NONE][..]).into()
    } else {
        (&[russh::compression::NONE][..]).into()
    };

    let preferred = russh::Preferred {
        compression,
        ..Default::default()
    };

    Arc::new(client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(Duration::from_secs(30)),
        keepalive_max: 3,
        preferred,
        ..Default::default()
    })
}

/// An authenticated SSH connection.
pub struct SshTransport {
    handle: client::Handle<SshClientHandler>,
}

impl SshTransport {
    /// Connect to `config.server` and authenticate as `config.username`.
    pub async fn connect(config: &ClientConfig) -> Result<Self> {
        let server = &config.server;
        let ssh_config = build_client_config(config.compression);

        info!("Connecting to {}@{}", config.username, server);

        let connect_future = client::connect(
            ssh_config,
            (server.host.as_str(), server.port),
            SshClientHandler,
        );

        let mut handle = tokio::time::timeout(config.connect_timeout, connect_future)
            .await
            .map_err(|_| {
                Error::Connect(format!(
                    "Connection to {} timed out after {:?}",
                    server, config.connect_timeout
                ))
            })?
            .map_err(|e| Error::Connect(format!("Failed to connect to {}: {}", server, e)))?;

        let chain = AuthChain::from_config(config);
        if !chain.authenticate(&mut handle, &config.username).await? {
            return Err(Error::Authentication(
                "no authentication methods succeeded".to_string(),
            ));
        }

        info!("Connected to {}@{}", config.username, server);
        Ok(Self { handle })
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn open_command_channel(&self) -> Result<CommandChannel> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| Error::transport("Failed to open channel", e))?;

        let (read_half, write_half) = channel.split();
        let (stdout_tx, stdout_rx) = mpsc::unbounded_channel();
        let (stderr_tx, stderr_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();

        tokio::spawn(pump_channel(read_half, stdout_tx, stderr_tx, exit_tx));

        Ok(CommandChannel {
            stdin: Box::new(write_half.make_writer()),
            stdout: queue_reader(stdout_rx),
            stderr: queue_reader(stderr_rx),
            control: Box::new(SshChannelControl {
                write_half,
                exit: Some(exit_rx),
            }),
        })
    }

    async fn dial(&self, remote: &Endpoint) -> Result<ForwardStream> {
        let channel = self
            .handle
            .channel_open_direct_tcpip(
                remote.host.clone(),
                u32::from(remote.port),
                "127.0.0.1",
                0, // Originator port is not significant for direct-tcpip
            )
            .await
            .map_err(|e| Error::transport(&format!("Failed to dial {}", remote), e))?;

        Ok(Box::new(channel.into_stream()))
    }

    fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    async fn disconnect(&self) -> Result<()> {
        self.handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
            .map_err(|e| Error::transport("Failed to disconnect", e))
    }
}

/// Expose a queue of chunks as an `AsyncRead`. EOF once the sender is gone.
fn queue_reader(rx: mpsc::UnboundedReceiver<Bytes>) -> BoxedReader {
    let chunks = stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (Ok::<_, io::Error>(chunk), rx))
    });
    Box::new(StreamReader::new(Box::pin(chunks)))
}

/// Route channel messages until the channel closes.
async fn pump_channel(
    mut read_half: ChannelReadHalf,
    stdout: mpsc::UnboundedSender<Bytes>,
    stderr: mpsc::UnboundedSender<Bytes>,
    exit: oneshot::Sender<Option<u32>>,
) {
    let mut stdout = Some(stdout);
    let mut stderr = Some(stderr);
    let mut exit_status = None;

    while let Some(msg) = read_half.wait().await {
        match msg {
            ChannelMsg::Data { data } => {
                if let Some(tx) = &stdout {
                    let _ = tx.send(Bytes::copy_from_slice(&data));
                }
            }
            ChannelMsg::ExtendedData { data, ext } if ext == SSH_EXTENDED_DATA_STDERR => {
                if let Some(tx) = &stderr {
                    let _ = tx.send(Bytes::copy_from_slice(&data));
                }
            }
            ChannelMsg::ExitStatus { exit_status: code } => {
                exit_status = Some(code);
            }
            ChannelMsg::Eof => {
                // No more output; let the readers see EOF
                stdout = None;
                stderr = None;
            }
            ChannelMsg::Close => break,
            _ => {}
        }
    }

    debug!("Command channel closed, exit status {:?}", exit_status);
    drop(stdout);
    drop(stderr);
    let _ = exit.send(exit_status);
}

struct SshChannelControl {
    write_half: ChannelWriteHalf<client::Msg>,
    exit: Option<oneshot::Receiver<Option<u32>>>,
}

#[async_trait]
impl ChannelControl for SshChannelControl {
    async fn start(&mut self, command: &str) -> Result<()> {
        self.write_half
            .exec(true, command)
            .await
            .map_err(|e| Error::transport("Failed to execute command", e))
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
        match self.write_half.close().await {
            Ok(()) => Ok(()),
            // The session side of the channel is already gone
            Err(russh::Error::SendError) => Ok(()),
            Err(e) => Err(Error::transport("Failed to close channel", e)),
        }
    }
}
