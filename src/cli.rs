use clap::{Parser, Subcommand};
use eyre::eyre;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::ports::{allocate_port, LOOPBACK};
use crate::server_args::ServerArgs;
use crate::supervisor::SupervisorConfig;

use super::Result;

/// Starts, probes and cleans up ephemeral NATS servers for client tests
#[derive(Parser, Debug)]
#[command(name = "natsfix")]
#[command(about = "Starts, probes and cleans up ephemeral NATS servers for client tests")]
#[command(version)]
pub struct Cli {
    /// Server executable to supervise
    #[arg(long, default_value = "nats-server", global = true)]
    pub executable: PathBuf,

    /// Run the server verbose with its output attached
    #[arg(long, global = true)]
    pub debug: bool,

    /// Never attach server output to the console
    #[arg(long, global = true)]
    pub hide_window: bool,

    /// Leave the server running on exit for inspection
    #[arg(long, global = true)]
    pub leave_running: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Kill stray server processes left behind by earlier runs
    Cleanup,

    /// Start a server and keep it running until Ctrl-C
    Serve {
        /// Port to listen on (0 picks a free port)
        #[arg(long, default_value = "4222")]
        port: u16,

        /// Server configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Enable JetStream
        #[arg(long)]
        jetstream: bool,

        /// Token clients must present
        #[arg(long)]
        auth: Option<String>,

        /// Skip readiness verification and wait a fixed settle delay instead
        #[arg(long)]
        no_verify: bool,

        /// Settle delay used with --no-verify (ms)
        #[arg(long, default_value = "500")]
        settle_ms: u64,

        /// Per-probe timeout (ms)
        #[arg(long, default_value = "1000")]
        probe_timeout_ms: u64,
    },

    /// Run a single readiness probe against a server
    Probe {
        #[arg(long, default_value = "4222")]
        port: u16,

        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        #[arg(long)]
        auth: Option<String>,

        /// Probe timeout (ms)
        #[arg(long, default_value = "1000")]
        timeout_ms: u64,
    },
}

/// What the binary was asked to do, with everything resolved
#[derive(Debug, Clone)]
pub enum Action {
    Cleanup,
    Serve {
        port: u16,
        args: ServerArgs,
        verify: bool,
        settle_delay: Duration,
        probe_timeout: Duration,
    },
    Probe {
        addr: SocketAddr,
        auth_token: Option<String>,
        timeout: Duration,
    },
}

/// Configuration for the natsfix binary
#[derive(Debug, Clone)]
pub struct Config {
    pub supervisor: SupervisorConfig,
    pub action: Action,
}

impl Config {
    /// Parse command line arguments into configuration
    pub fn from_cli(cli: Cli) -> Result<Self> {
        let supervisor = SupervisorConfig {
            executable: cli.executable,
            debug_mode: cli.debug,
            hide_window: cli.hide_window,
            leave_running: cli.leave_running,
            ..Default::default()
        };

        let action = match cli.command {
            Command::Cleanup => Action::Cleanup,
            Command::Serve {
                port,
                config,
                jetstream,
                auth,
                no_verify,
                settle_ms,
                probe_timeout_ms,
            } => {
                let port = if port == 0 { allocate_port(LOOPBACK)? } else { port };
                let args = ServerArgs {
                    config_file: config,
                    jetstream,
                    auth_token: auth,
                    ..Default::default()
                };
                Action::Serve {
                    port,
                    args,
                    verify: !no_verify,
                    settle_delay: Duration::from_millis(settle_ms),
                    probe_timeout: Duration::from_millis(probe_timeout_ms),
                }
            }
            Command::Probe {
                port,
                host,
                auth,
                timeout_ms,
            } => {
                let ip: IpAddr = host
                    .parse()
                    .map_err(|e| eyre!("Invalid host address '{}': {}", host, e))?;
                Action::Probe {
                    addr: SocketAddr::new(ip, port),
                    auth_token: auth,
                    timeout: Duration::from_millis(timeout_ms),
                }
            }
        };

        Ok(Config { supervisor, action })
    }
}
