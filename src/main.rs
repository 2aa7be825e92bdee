#![deny(warnings)]
#![deny(clippy::unwrap_used)]

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use dotenv::dotenv;
use sshit::{Client, ClientConfig, Endpoint};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "sshit")]
#[command(about = "Run commands, push files and forward ports over SSH", long_about = None)]
struct Cli {
    /// SSH server host name or address
    #[arg(long, global = true, env = "SSHIT_HOST", default_value = "localhost")]
    host: String,

    /// SSH server port
    #[arg(long, global = true, env = "SSHIT_PORT", default_value_t = 22)]
    port: u16,

    /// Remote user
    #[arg(long, global = true, env = "SSHIT_USER", default_value = "root")]
    user: String,

    /// Password (tried before the key file)
    #[arg(long, global = true, env = "SSHIT_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Private key file
    #[arg(long, global = true, env = "SSHIT_KEY")]
    key: Option<PathBuf>,

    /// Command timeout in seconds
    #[arg(long, global = true)]
    timeout: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command and print its output
    Run {
        /// Command line passed to the remote shell
        command: String,
    },

    /// Copy a local file to the server
    Copy {
        /// Local file
        source: PathBuf,
        /// Remote destination path
        target: String,
    },

    /// Forward a local port to a host reachable from the server
    #[cfg(feature = "port_forward")]
    Forward {
        /// Local port on 127.0.0.1 (0 picks a free one)
        local_port: u16,
        /// Destination host as seen from the server
        remote_host: String,
        /// Destination port
        remote_port: u16,
    },
}

impl Cli {
    fn client_config(&self) -> ClientConfig {
        let mut config =
            ClientConfig::from_env(Endpoint::new(self.host.clone(), self.port), self.user.clone());

        if let Some(password) = &self.password {
            config = config.with_password(password.clone());
        }
        if let Some(key) = &self.key {
            config = config.with_key_path(key.clone());
        }
        if let Some(secs) = self.timeout {
            config = config.with_command_timeout(Duration::from_secs(secs));
        }

        config
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().expect("valid directive")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match execute(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn execute(cli: Cli) -> sshit::Result<ExitCode> {
    let mut client = Client::new(cli.client_config());
    client.connect().await?;

    let result = match cli.command {
        Commands::Run { command } => match client.run(&command).await {
            Ok(output) => {
                print!("{}", output.stdout);
                eprint!("{}", output.stderr);
                Ok(ExitCode::SUCCESS)
            }
            Err(sshit::Error::ExitStatus(code)) => {
                warn!("Command exited with status {}", code);
                Ok(ExitCode::from(u8::try_from(code).unwrap_or(u8::MAX)))
            }
            Err(e) => Err(e),
        },
        Commands::Copy { source, target } => client
            .copy(&source, &target)
            .await
            .map(|()| ExitCode::SUCCESS),
        #[cfg(feature = "port_forward")]
        Commands::Forward {
            local_port,
            remote_host,
            remote_port,
        } => forward(&client, local_port, remote_host, remote_port).await,
    };

    client.close().await?;
    result
}

#[cfg(feature = "port_forward")]
async fn forward(
    client: &Client,
    local_port: u16,
    remote_host: String,
    remote_port: u16,
) -> sshit::Result<ExitCode> {
    use sshit::{ForwardTunnel, Tunnel};

    let mut tunnel = ForwardTunnel::new(
        Endpoint::new("127.0.0.1", local_port),
        Endpoint::new(remote_host, remote_port),
    );
    tunnel.bind(client).await?;

    info!(
        "Listening on {}, press Ctrl-C to stop",
        tunnel.local().address()
    );
    tokio::signal::ctrl_c().await?;

    let errs = tunnel.close().await;
    for e in &errs {
        warn!("Tunnel teardown: {}", e);
    }

    Ok(ExitCode::SUCCESS)
}
