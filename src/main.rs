type Result<T> = color_eyre::eyre::Result<T>;

use clap::Parser;
use eyre::eyre;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use natsfix::cli::{Action, Cli, Config};
use natsfix::{NatsProbe, ProbeTarget, ProcessSupervisor, ReadinessProbe, ServerArgs};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::from_cli(cli)?;
    let supervisor = ProcessSupervisor::new(config.supervisor.clone());

    match config.action {
        Action::Cleanup => {
            let report = supervisor.global_cleanup().await?;
            info!(
                "cleanup finished: {} killed, {} survivors",
                report.killed.len(),
                report.survivors.len()
            );
            if !report.is_clean() {
                return Err(eyre!("stray processes survived cleanup: {:?}", report.survivors));
            }
        }
        Action::Serve {
            port,
            args,
            verify,
            settle_delay,
            probe_timeout,
        } => serve(&supervisor, port, args, verify, settle_delay, probe_timeout).await?,
        Action::Probe {
            addr,
            auth_token,
            timeout: limit,
        } => {
            let target = ProbeTarget::new(addr).with_auth_token(auth_token);
            match timeout(limit, NatsProbe::new().probe(&target)).await {
                Ok(Ok(())) => info!("server at {} is ready", addr),
                Ok(Err(e)) => return Err(eyre!("server at {} is not ready: {}", addr, e)),
                Err(_) => return Err(eyre!("probe against {} timed out after {:?}", addr, limit)),
            }
        }
    }

    Ok(())
}

/// Runs one server until Ctrl-C or until it exits on its own.
async fn serve(
    supervisor: &ProcessSupervisor,
    port: u16,
    args: ServerArgs,
    verify: bool,
    settle_delay: Duration,
    probe_timeout: Duration,
) -> Result<()> {
    supervisor.cleanup_once().await?;

    let mut handle = if verify {
        supervisor.start_and_verify(port, args, probe_timeout).await?
    } else {
        supervisor.start(port, args, settle_delay).await?
    };
    info!("server listening on {} (pid {:?})", handle.addr(), handle.pid());

    let mut liveness = tokio::time::interval(Duration::from_millis(500));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, stopping server");
                break;
            }
            _ = liveness.tick() => {
                if !handle.is_alive() {
                    warn!("server exited on its own: {:?}", handle.exit_status());
                    break;
                }
            }
        }
    }

    supervisor.shutdown(&mut handle).await;
    info!("natsfix exiting");
    Ok(())
}
