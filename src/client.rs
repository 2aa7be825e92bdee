//! Connection lifecycle and the request/response entry points.
//!
//! A [`Client`] owns one [`Transport`] and the root [`Scope`] of its
//! cancellation tree. Commands and tunnels derive their scopes from that
//! root, so [`Client::close`] stops everything still running on the
//! connection before the transport is torn down.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::command::{self, CommandOutput};
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::scope::Scope;
use crate::scp;
use crate::session::SshTransport;
use crate::transport::Transport;

/// A connection to one SSH server.
pub struct Client {
    config: ClientConfig,
    transport: Option<Arc<dyn Transport>>,
    root: Option<Scope>,
}

impl Client {
    /// Create an unconnected client.
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            transport: None,
            root: None,
        }
    }

    /// Create a client on top of an already established transport.
    pub fn with_transport(config: ClientConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            config,
            transport: Some(transport),
            root: Some(Scope::root()),
        }
    }

    /// Connect and authenticate. Calling this on a connected client does
    /// nothing.
    ///
    /// # Errors
    ///
    /// * [`Error::Connect`] - the server could not be reached in time
    /// * [`Error::Authentication`] - every configured method was rejected
    pub async fn connect(&mut self) -> Result<()> {
        if self.is_connected() {
            debug!("Already connected to {}", self.config.server);
            return Ok(());
        }

        let transport = SshTransport::connect(&self.config).await?;
        self.transport = Some(Arc::new(transport));
        self.root = Some(Scope::root());
        Ok(())
    }

    /// Cancel every command and tunnel derived from this client, then
    /// disconnect. Closing a closed client is a no-op.
    pub async fn close(&mut self) -> Result<()> {
        if let Some(root) = self.root.take() {
            root.cancel();
        }

        let Some(transport) = self.transport.take() else {
            return Ok(());
        };

        if transport.is_closed() {
            return Ok(());
        }

        info!("Disconnecting from {}", self.config.server);
        transport.disconnect().await
    }

    pub fn is_connected(&self) -> bool {
        self.transport.as_ref().is_some_and(|t| !t.is_closed())
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// The live transport, or [`Error::NotConnected`].
    pub(crate) fn transport(&self) -> Result<Arc<dyn Transport>> {
        match &self.transport {
            Some(transport) if !transport.is_closed() => Ok(transport.clone()),
            _ => Err(Error::NotConnected),
        }
    }

    /// The root scope, or [`Error::NotConnected`].
    pub(crate) fn scope(&self) -> Result<&Scope> {
        match &self.root {
            Some(root) if !root.is_cancelled() => Ok(root),
            _ => Err(Error::NotConnected),
        }
    }

    /// Run `command` with the configured command timeout.
    pub async fn run(&self, command: &str) -> Result<CommandOutput> {
        self.run_with_timeout(command, self.config.command_timeout)
            .await
    }

    /// Run `command`, failing with [`Error::Timeout`] after `timeout`.
    pub async fn run_with_timeout(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        let transport = self.transport()?;
        let scope = self.scope()?;

        command::run(transport.as_ref(), scope, command, timeout).await
    }

    /// Copy the local file `source` to `target` on the server.
    pub async fn copy(&self, source: impl AsRef<Path>, target: &str) -> Result<()> {
        let transport = self.transport()?;
        let scope = self.scope()?;

        scp::push(transport.as_ref(), scope, source.as_ref(), target).await
    }
}
