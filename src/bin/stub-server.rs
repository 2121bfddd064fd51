//! Minimal stand-in for `nats-server`.
//!
//! Accepts the flags the supervisor passes, answers the client handshake
//! (INFO, CONNECT, PING/PONG), exits on SIGTERM and drains on SIGUSR2.
//! `--signal ldm=<pid>` delivers the lame duck signal to a running instance.
//! Extra knobs delay startup or ignore SIGTERM so tests can reach the slow
//! and forceful paths of the supervisor.

type Result<T> = color_eyre::eyre::Result<T>;

use clap::Parser;
use eyre::eyre;
use futures::StreamExt;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::sleep;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "stub-server")]
struct Args {
    /// Port to listen on
    #[arg(short = 'p', long = "port", required_unless_present = "signal")]
    port: Option<u16>,

    /// Signal a running server instead of starting one (`ldm=<pid>`, `stop=<pid>`)
    #[arg(long)]
    signal: Option<String>,

    /// Configuration file (only logged)
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    #[arg(long)]
    jetstream: bool,

    /// Token clients must present in CONNECT
    #[arg(long)]
    auth: Option<String>,

    #[arg(short = 'D')]
    debug: bool,

    #[arg(short = 'V')]
    trace: bool,

    /// Wait this long before binding the port (ms)
    #[arg(long, default_value = "0")]
    startup_delay_ms: u64,

    /// Keep running on SIGTERM
    #[arg(long)]
    ignore_sigterm: bool,

    /// Time spent draining in lame duck mode before exiting (ms)
    #[arg(long, default_value = "100")]
    lame_duck_grace_ms: u64,
}

enum Exit {
    Terminated,
    LameDuck,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();

    let filter = if args.debug || args.trace {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env()
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Some(ref command) = args.signal {
        return send_signal(command);
    }
    let Some(port) = args.port else {
        return Err(eyre!("--port is required"));
    };

    info!(
        "stub-server starting on port {} (config: {:?}, jetstream: {})",
        port, args.config, args.jetstream
    );

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigusr2 = signal(SignalKind::user_defined2())?;

    let startup = sleep(Duration::from_millis(args.startup_delay_ms));
    tokio::pin!(startup);
    loop {
        tokio::select! {
            _ = &mut startup => break,
            _ = sigterm.recv() => {
                if !args.ignore_sigterm {
                    info!("terminated during startup");
                    return Ok(());
                }
            }
        }
    }

    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    info!("Listening for client connections on {}", listener.local_addr()?);

    let exit = loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!("client connected from {}", peer);
                        let auth = args.auth.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_client(stream, port, auth).await {
                                debug!("client {} disconnected: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => warn!("accept failed: {}", e),
                }
            }
            _ = sigterm.recv() => {
                if args.ignore_sigterm {
                    info!("ignoring SIGTERM");
                } else {
                    break Exit::Terminated;
                }
            }
            _ = sigusr2.recv() => break Exit::LameDuck,
        }
    };

    drop(listener);
    match exit {
        Exit::Terminated => info!("terminated, exiting"),
        Exit::LameDuck => {
            info!("entering lame duck mode, draining for {}ms", args.lame_duck_grace_ms);
            sleep(Duration::from_millis(args.lame_duck_grace_ms)).await;
            info!("lame duck drain complete, exiting");
        }
    }
    Ok(())
}

fn send_signal(command: &str) -> Result<()> {
    let (name, pid) = command
        .split_once('=')
        .ok_or_else(|| eyre!("expected <command>=<pid>, got '{}'", command))?;
    let pid: i32 = pid.parse().map_err(|e| eyre!("invalid pid '{}': {}", pid, e))?;
    let signal = match name {
        "ldm" => Signal::SIGUSR2,
        "stop" => Signal::SIGTERM,
        other => return Err(eyre!("unknown signal command '{}'", other)),
    };
    info!("sending {:?} to {}", signal, pid);
    kill(Pid::from_raw(pid), signal)?;
    Ok(())
}

async fn serve_client(stream: TcpStream, port: u16, auth: Option<String>) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let info = format!(
        "INFO {{\"server_id\":\"stub\",\"version\":\"0.0.0\",\"port\":{},\"auth_required\":{},\"max_payload\":1048576}}\r\n",
        port,
        auth.is_some()
    );
    write_half.write_all(info.as_bytes()).await?;

    let mut lines = FramedRead::new(read_half, LinesCodec::new_with_max_length(64 * 1024));
    while let Some(line) = lines.next().await {
        let line = line?;
        if let Some(options) = line.strip_prefix("CONNECT ") {
            if let Some(ref token) = auth {
                let expected = format!("\"auth_token\":\"{}\"", token);
                if !options.contains(&expected) {
                    write_half.write_all(b"-ERR 'Authorization Violation'\r\n").await?;
                    return Ok(());
                }
            }
        } else if line == "PING" {
            write_half.write_all(b"PONG\r\n").await?;
        } else if line == "PONG" {
            continue;
        } else {
            debug!("ignoring client line: {}", line);
        }
    }
    Ok(())
}
