//! Client configuration.
//!
//! Timeouts and compression are resolved with a three-tier priority:
//!
//! 1. **Parameter** - Explicitly provided value (highest priority)
//! 2. **Environment Variable** - Value from environment variable
//! 3. **Default** - Built-in default value (lowest priority)
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `SSHIT_CONNECT_TIMEOUT` | 30s | Connection timeout in seconds |
//! | `SSHIT_COMMAND_TIMEOUT` | 60s | Command execution timeout in seconds |
//! | `SSHIT_COMPRESSION` | true | Enable zlib compression |

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::endpoint::Endpoint;

/// Default SSH connection timeout in seconds
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default command execution timeout in seconds
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 60;

/// Environment variable name for the connection timeout
pub const CONNECT_TIMEOUT_ENV_VAR: &str = "SSHIT_CONNECT_TIMEOUT";

/// Environment variable name for the command timeout
pub const COMMAND_TIMEOUT_ENV_VAR: &str = "SSHIT_COMMAND_TIMEOUT";

/// Environment variable name for compression
pub const COMPRESSION_ENV_VAR: &str = "SSHIT_COMPRESSION";

/// Everything needed to establish and use one SSH connection.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// SSH server to connect to
    pub server: Endpoint,

    /// Username for authentication
    pub username: String,

    /// Password for password authentication
    pub password: Option<String>,

    /// Path to a private key file for key authentication
    pub key_path: Option<PathBuf>,

    /// Timeout for TCP connect plus SSH handshake
    pub connect_timeout: Duration,

    /// Deadline shared by output draining and exit wait in `Client::run`
    pub command_timeout: Duration,

    /// Whether to offer zlib compression
    pub compression: bool,
}

impl ClientConfig {
    /// Create a configuration with defaults for everything but server and user.
    pub fn new(server: Endpoint, username: impl Into<String>) -> Self {
        Self {
            server,
            username: username.into(),
            password: None,
            key_path: None,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            command_timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS),
            compression: true,
        }
    }

    /// Create a configuration whose timeouts and compression come from the
    /// environment when set.
    pub fn from_env(server: Endpoint, username: impl Into<String>) -> Self {
        Self::new(server, username)
            .with_connect_timeout(Duration::from_secs(resolve_connect_timeout(None)))
            .with_command_timeout(Duration::from_secs(resolve_command_timeout(None)))
            .with_compression(resolve_compression(None))
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_key_path(mut self, key_path: impl Into<PathBuf>) -> Self {
        self.key_path = Some(key_path.into());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_compression(mut self, compression: bool) -> Self {
        self.compression = compression;
        self
    }
}

/// Resolve the connection timeout with priority: parameter -> env var -> default
pub fn resolve_connect_timeout(timeout_param: Option<u64>) -> u64 {
    resolve_secs(timeout_param, CONNECT_TIMEOUT_ENV_VAR, DEFAULT_CONNECT_TIMEOUT_SECS)
}

/// Resolve the command timeout with priority: parameter -> env var -> default
pub fn resolve_command_timeout(timeout_param: Option<u64>) -> u64 {
    resolve_secs(timeout_param, COMMAND_TIMEOUT_ENV_VAR, DEFAULT_COMMAND_TIMEOUT_SECS)
}

fn resolve_secs(param: Option<u64>, var: &str, default: u64) -> u64 {
    if let Some(secs) = param {
        return secs;
    }

    if let Ok(value) = env::var(var)
        && let Ok(secs) = value.parse::<u64>()
    {
        return secs;
    }

    default
}

/// Resolve the compression setting with priority: parameter -> env var -> default (true)
pub fn resolve_compression(compress_param: Option<bool>) -> bool {
    if let Some(compress) = compress_param {
        return compress;
    }

    if let Ok(env_compress) = env::var(COMPRESSION_ENV_VAR) {
        return env_compress.eq_ignore_ascii_case("true") || env_compress == "1";
    }

    true
}
