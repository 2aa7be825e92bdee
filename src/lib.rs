//! Run commands, push files and forward ports over one SSH connection.
//!
//! ```no_run
//! use sshit::{Client, ClientConfig, Endpoint};
//!
//! # async fn example() -> sshit::Result<()> {
//! let config = ClientConfig::from_env(Endpoint::new("build-01", 22), "deploy")
//!     .with_key_path("/home/deploy/.ssh/id_ed25519");
//! let mut client = Client::new(config);
//! client.connect().await?;
//!
//! let output = client.run("uname -a").await?;
//! print!("{}", output.stdout);
//!
//! client.copy("target/release/app", "/opt/app/bin/app").await?;
//! client.close().await
//! # }
//! ```
//!
//! Port forwarding lives in [`tunnel`] behind the `port_forward` feature
//! (enabled by default).

pub mod auth;
pub mod client;
pub mod command;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod scope;
pub mod scp;
pub mod session;
pub mod transport;
#[cfg(feature = "port_forward")]
pub mod tunnel;

#[cfg(test)]
mod testing;

pub use client::Client;
pub use command::CommandOutput;
pub use config::ClientConfig;
pub use endpoint::Endpoint;
pub use error::{Error, Result};
pub use scope::Scope;
pub use session::SshTransport;
pub use transport::{ChannelControl, CommandChannel, ForwardStream, Transport};
#[cfg(feature = "port_forward")]
pub use tunnel::{ForwardTunnel, Tunnel};
