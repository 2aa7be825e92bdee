//! Host and port pairs used for the SSH server and for tunnel ends.

use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Default SSH port used when an address carries no port.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// A host name (or IP literal) and a TCP port.
///
/// Port `0` is allowed before a listener is bound and means "let the OS pick".
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Returns the `host:port` form accepted by socket APIs.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Returns a copy of this endpoint with a different port.
    pub(crate) fn with_port(&self, port: u16) -> Self {
        Self {
            host: self.host.clone(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Parses `host:port` or a bare `host` (which gets [`DEFAULT_SSH_PORT`]).
///
/// Uses `rsplit_once` so that bracketed IPv6 literals like `[::1]:22` keep
/// their inner colons.
impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(address: &str) -> Result<Self, Self::Err> {
        match address.rsplit_once(':') {
            Some((host, port)) if !host.ends_with(':') => {
                let port = port
                    .parse::<u16>()
                    .map_err(|e| Error::Config(format!("Invalid port number: {}", e)))?;
                Ok(Self::new(host, port))
            }
            _ => Ok(Self::new(address, DEFAULT_SSH_PORT)),
        }
    }
}
