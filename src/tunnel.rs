//! Local port forwarding.
//!
//! A [`ForwardTunnel`] listens on a local endpoint and forwards every
//! accepted connection to a remote endpoint through the client's
//! transport (a `direct-tcpip` channel with [`crate::session::SshTransport`]).
//!
//! # Tasks
//!
//! Binding spawns two members into the tunnel's scope:
//!
//! 1. **Accept loop**: accepts local connections and queues them.
//! 2. **Dispatcher**: takes queued connections and spawns one forwarder
//!    per connection, each under its own child token.
//!
//! A forwarder dials the remote endpoint and then copies bytes in both
//! directions until each side reaches EOF. Every blocking step (accept,
//! dial, copy) is raced against the scope's token; when the token fires the
//! step is abandoned and the sockets it owned are shut down and dropped.
//! A copy that fails with a "closed" error after cancellation is a normal
//! ending, not a failure.
//!
//! # Errors
//!
//! Background failures never abort the tunnel. They are collected and
//! returned by [`Tunnel::close`].
//!
//! # Feature Gate
//!
//! This module is only compiled when the `port_forward` feature is enabled.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::Client;
use crate::endpoint::Endpoint;
use crate::error::{Error, Result, is_closed_io};
use crate::scope::{Scope, TaskGroup};
use crate::transport::Transport;

/// Accepted connections waiting for the dispatcher.
const ACCEPT_QUEUE_DEPTH: usize = 32;

/// A local-to-remote forward.
#[async_trait]
pub trait Tunnel: Send {
    /// Start listening and forwarding.
    ///
    /// # Errors
    ///
    /// * [`Error::NotConnected`] - `client` has no live connection
    /// * [`Error::Protocol`] - the tunnel was already bound or closed
    /// * [`Error::Transport`] - the local endpoint could not be bound
    async fn bind(&mut self, client: &Client) -> Result<()>;

    /// Stop accepting, cancel every in-flight connection and wait for all
    /// background tasks. Returns the errors they produced.
    async fn close(&mut self) -> Vec<Error>;

    /// Local endpoint; after `bind` the port is the one actually bound.
    fn local(&self) -> &Endpoint;

    fn remote(&self) -> &Endpoint;
}

enum TunnelState {
    Unbound,
    Bound(Scope),
    Closed,
}

/// Forwards connections accepted on `local` to `remote`.
pub struct ForwardTunnel {
    local: Endpoint,
    remote: Endpoint,
    state: TunnelState,
}

impl ForwardTunnel {
    /// Create an unbound tunnel. A local port of 0 lets the OS choose.
    pub fn new(local: Endpoint, remote: Endpoint) -> Self {
        Self {
            local,
            remote,
            state: TunnelState::Unbound,
        }
    }

    pub fn is_bound(&self) -> bool {
        matches!(self.state, TunnelState::Bound(_))
    }
}

#[async_trait]
impl Tunnel for ForwardTunnel {
    async fn bind(&mut self, client: &Client) -> Result<()> {
        match self.state {
            TunnelState::Unbound => {}
            TunnelState::Bound(_) => {
                return Err(Error::Protocol(format!(
                    "tunnel {} -> {} is already bound",
                    self.local, self.remote
                )));
            }
            TunnelState::Closed => {
                return Err(Error::Protocol(format!(
                    "tunnel {} -> {} is closed",
                    self.local, self.remote
                )));
            }
        }

        let transport = client.transport()?;
        let scope = client.scope()?.child();

        let listener = TcpListener::bind(self.local.address())
            .await
            .map_err(|e| Error::transport(&format!("Failed to bind to {}", self.local), e))?;
        let bound = listener.local_addr()?;
        self.local = self.local.with_port(bound.port());

        let (accepted_tx, accepted_rx) = mpsc::channel(ACCEPT_QUEUE_DEPTH);
        scope.spawn(accept_loop(listener, accepted_tx, scope.token().clone()));
        scope.spawn(dispatch(
            accepted_rx,
            transport,
            self.remote.clone(),
            scope.token().clone(),
            scope.group(),
        ));

        info!("Forwarding {} -> {}", self.local, self.remote);
        self.state = TunnelState::Bound(scope);
        Ok(())
    }

    async fn close(&mut self) -> Vec<Error> {
        let TunnelState::Bound(mut scope) = std::mem::replace(&mut self.state, TunnelState::Closed)
        else {
            return Vec::new();
        };

        let errs = scope.shutdown().await;
        if errs.is_empty() {
            info!("Closed tunnel {} -> {}", self.local, self.remote);
        } else {
            warn!(
                "Closed tunnel {} -> {} with {} error(s)",
                self.local,
                self.remote,
                errs.len()
            );
        }
        errs
    }

    fn local(&self) -> &Endpoint {
        &self.local
    }

    fn remote(&self) -> &Endpoint {
        &self.remote
    }
}

/// Accept local connections until cancelled.
///
/// The listener is dropped (closed) on return. Queued connections that the
/// dispatcher never picked up are dropped with the queue.
async fn accept_loop(
    listener: TcpListener,
    accepted: mpsc::Sender<(TcpStream, SocketAddr)>,
    token: CancellationToken,
) -> Result<()> {
    loop {
        let conn = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(()),
            conn = listener.accept() => conn,
        };

        match conn {
            Ok(conn) => {
                debug!("Accepted forwarded connection from {}", conn.1);
                let sent = tokio::select! {
                    biased;
                    _ = token.cancelled() => return Ok(()),
                    sent = accepted.send(conn) => sent,
                };
                if sent.is_err() {
                    return Ok(());
                }
            }
            Err(_) if token.is_cancelled() => return Ok(()),
            Err(e) => {
                error!("Error accepting connection: {}", e);
                return Err(Error::transport("Failed to accept connection", e));
            }
        }
    }
}

/// Spawn one forwarder per queued connection.
async fn dispatch(
    mut accepted: mpsc::Receiver<(TcpStream, SocketAddr)>,
    transport: Arc<dyn Transport>,
    remote: Endpoint,
    token: CancellationToken,
    group: TaskGroup,
) -> Result<()> {
    loop {
        let (stream, peer) = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(()),
            next = accepted.recv() => match next {
                Some(conn) => conn,
                None => return Ok(()),
            },
        };

        group.spawn(forward(
            stream,
            peer,
            transport.clone(),
            remote.clone(),
            token.child_token(),
            group.clone(),
        ));
    }
}

/// Dial `remote` and copy bytes both ways between it and `local`.
async fn forward(
    local: TcpStream,
    peer: SocketAddr,
    transport: Arc<dyn Transport>,
    remote: Endpoint,
    token: CancellationToken,
    group: TaskGroup,
) -> Result<()> {
    let dialed = tokio::select! {
        biased;
        _ = token.cancelled() => return Ok(()),
        dialed = transport.dial(&remote) => dialed,
    };

    // On failure `local` is dropped here, which closes the client's socket
    let remote_stream = dialed.inspect_err(|e| {
        debug!("Forward from {} to {} failed: {}", peer, remote, e);
    })?;

    let (local_read, local_write) = tokio::io::split(local);
    let (remote_read, remote_write) = tokio::io::split(remote_stream);

    let (outbound, inbound) = tokio::join!(
        pipe(local_read, remote_write, &token),
        pipe(remote_read, local_write, &token),
    );

    debug!("Forward from {} to {} finished", peer, remote);

    match (outbound, inbound) {
        (Err(first), Err(second)) => {
            group.report(first);
            Err(second)
        }
        (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
        (Ok(()), Ok(())) => Ok(()),
    }
}

/// Copy `reader` into `writer` until EOF or cancellation, then shut the
/// writer down so the peer sees EOF.
///
/// A failed direction cancels `token` so the opposite direction stops too.
async fn pipe<R, W>(mut reader: R, mut writer: W, token: &CancellationToken) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copied = tokio::select! {
        biased;
        _ = token.cancelled() => Ok(0),
        copied = tokio::io::copy(&mut reader, &mut writer) => copied,
    };
    let _ = writer.shutdown().await;

    match copied {
        Ok(_) => Ok(()),
        Err(e) if token.is_cancelled() && is_closed_io(&e) => Ok(()),
        Err(e) => {
            token.cancel();
            Err(e.into())
        }
    }
}
