//! Authentication methods for SSH connections.
//!
//! Each method implements [`AuthMethod`]; an [`AuthChain`] tries them in
//! the order they were added and stops at the first success.
//!
//! - [`Password`]: username/password
//! - [`KeyFile`]: private key file (passphrase-less keys)
//! - [`Agent`]: every identity offered by the agent behind `SSH_AUTH_SOCK`

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use russh::{client, keys};
use tracing::debug;

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::session::SshClientHandler;

/// A way of proving identity to the SSH server.
#[async_trait]
pub trait AuthMethod: Send + Sync {
    /// Attempt to authenticate.
    ///
    /// * `Ok(true)` - the server accepted the credentials
    /// * `Ok(false)` - the server rejected them
    /// * `Err(_)` - the attempt itself failed (unreadable key, no agent, ...)
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<bool>;

    /// Short name used in logs.
    fn name(&self) -> &'static str;
}

/// Password authentication.
pub struct Password(String);

impl Password {
    pub fn new(password: impl Into<String>) -> Self {
        Self(password.into())
    }
}

#[async_trait]
impl AuthMethod for Password {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<bool> {
        let result = handle
            .authenticate_password(username, &self.0)
            .await
            .map_err(|e| Error::Authentication(format!("password: {}", e)))?;

        Ok(result.success())
    }

    fn name(&self) -> &'static str {
        "password"
    }
}

/// Private key file authentication.
pub struct KeyFile {
    path: PathBuf,
}

impl KeyFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl AuthMethod for KeyFile {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<bool> {
        let key = keys::load_secret_key(&self.path, None).map_err(|e| {
            Error::Authentication(format!(
                "failed to load private key {}: {}",
                self.path.display(),
                e
            ))
        })?;

        // RSA keys need the strongest hash the server supports
        let hash_alg = handle
            .best_supported_rsa_hash()
            .await
            .ok()
            .flatten()
            .flatten();

        let result = handle
            .authenticate_publickey(
                username,
                keys::PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg),
            )
            .await
            .map_err(|e| Error::Authentication(format!("key: {}", e)))?;

        Ok(result.success())
    }

    fn name(&self) -> &'static str {
        "key"
    }
}

/// SSH agent authentication.
#[derive(Default)]
pub struct Agent;

#[async_trait]
impl AuthMethod for Agent {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<bool> {
        let mut agent = keys::agent::client::AgentClient::connect_env()
            .await
            .map_err(|e| Error::Authentication(format!("cannot reach SSH agent: {}", e)))?;

        let identities = agent
            .request_identities()
            .await
            .map_err(|e| Error::Authentication(format!("cannot list agent identities: {}", e)))?;

        for identity in identities {
            let hash_alg = handle
                .best_supported_rsa_hash()
                .await
                .ok()
                .flatten()
                .flatten();

            match handle
                .authenticate_publickey_with(username, identity.clone(), hash_alg, &mut agent)
                .await
            {
                Ok(result) if result.success() => return Ok(true),
                Ok(_) => debug!("Agent identity {:?} rejected", identity.comment()),
                Err(e) => debug!("Agent identity {:?} failed: {}", identity.comment(), e),
            }
        }

        Ok(false)
    }

    fn name(&self) -> &'static str {
        "agent"
    }
}

/// Ordered list of authentication methods.
#[derive(Default)]
pub struct AuthChain {
    methods: Vec<Box<dyn AuthMethod>>,
}

impl AuthChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Password first, then key file, falling back to the agent when the
    /// configuration carries no explicit credentials.
    pub fn from_config(config: &ClientConfig) -> Self {
        let mut chain = Self::new();

        if let Some(password) = &config.password {
            chain = chain.with(Password::new(password.clone()));
        }
        if let Some(key_path) = &config.key_path {
            chain = chain.with(KeyFile::new(key_path.clone()));
        }
        if chain.is_empty() {
            chain = chain.with(Agent);
        }

        chain
    }

    pub fn with(mut self, method: impl AuthMethod + 'static) -> Self {
        self.methods.push(Box::new(method));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.methods.iter().map(|m| m.name()).collect()
    }
}

#[async_trait]
impl AuthMethod for AuthChain {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<bool> {
        if self.methods.is_empty() {
            return Err(Error::Authentication(
                "no authentication methods configured".to_string(),
            ));
        }

        let mut last_error = None;

        for method in &self.methods {
            debug!("Trying authentication method: {}", method.name());

            match method.authenticate(handle, username).await {
                Ok(true) => {
                    debug!("Authenticated with method: {}", method.name());
                    return Ok(true);
                }
                Ok(false) => {
                    last_error = Some(Error::Authentication(format!(
                        "{} authentication rejected",
                        method.name()
                    )));
                }
                Err(e) => {
                    debug!("Authentication method {} failed: {}", method.name(), e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            Error::Authentication("all authentication methods failed".to_string())
        }))
    }

    fn name(&self) -> &'static str {
        "chain"
    }
}
