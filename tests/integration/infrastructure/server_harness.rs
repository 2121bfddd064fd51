use anyhow::{Context, Result};
use natsfix::ports::{allocate_port, LOOPBACK};
use natsfix::{NatsProbe, ProbeTarget, ProcessSupervisor, ReadinessProbe, ServerArgs, SupervisorConfig};
use nix::{sys::signal::Signal, unistd::Pid};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout};

/// Stub server built alongside the tests
pub fn stub_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_stub-server"))
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

pub fn free_port() -> Result<u16> {
    allocate_port(LOOPBACK).context("Failed to allocate a free port")
}

/// Arguments that make the stub delay binding its port
pub fn delayed_start(args: ServerArgs, delay: Duration) -> ServerArgs {
    args.with_extra(format!("--startup-delay-ms={}", delay.as_millis()))
}

/// Supervisor configuration tuned for tests: the stub server, short backoff.
pub fn fast_config(executable: impl Into<PathBuf>) -> SupervisorConfig {
    SupervisorConfig {
        executable: executable.into(),
        probe_attempts: 10,
        probe_backoff_step: Duration::from_millis(50),
        probe_timeout: Duration::from_millis(500),
        graceful_shutdown_timeout: Duration::from_millis(500),
        cleanup_attempts: 10,
        cleanup_backoff_step: Duration::from_millis(50),
        ..Default::default()
    }
}

/// Test harness for supervising stub servers and planting stray processes
pub struct ServerHarness {
    temp_dir: TempDir,
    strays: Vec<StrayProcess>,
}

impl ServerHarness {
    pub fn new() -> Result<Self> {
        init_tracing();
        let temp_dir = TempDir::new().context("Failed to create temporary directory")?;
        Ok(Self {
            temp_dir,
            strays: Vec::new(),
        })
    }

    pub fn temp_path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Supervisor running the stub server
    pub fn supervisor(&self) -> ProcessSupervisor {
        ProcessSupervisor::new(fast_config(stub_binary()))
    }

    /// Copies the stub server under `name`, so its processes can be told
    /// apart from servers other tests are running.
    pub fn renamed_stub(&self, name: &str) -> Result<PathBuf> {
        let target = self.temp_dir.path().join(name);
        if !target.exists() {
            std::fs::copy(stub_binary(), &target)
                .with_context(|| format!("Failed to copy stub server to {}", target.display()))?;
        }
        Ok(target)
    }

    /// Starts `executable` outside of any supervisor, as an earlier run
    /// that crashed would have left it.
    pub async fn spawn_stray(&mut self, executable: &Path) -> Result<Pid> {
        let port = free_port()?;
        self.spawn_stray_on(executable, port).await
    }

    /// Like [`Self::spawn_stray`], listening on a chosen port.
    pub async fn spawn_stray_on(&mut self, executable: &Path, port: u16) -> Result<Pid> {
        let mut last_error = None;

        // A freshly copied binary can briefly fail with ETXTBSY
        for _ in 0..5 {
            let mut cmd = Command::new(executable);
            cmd.args(["-p", &port.to_string()])
                .process_group(0)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null());

            match cmd.spawn() {
                Ok(child) => {
                    let pid = Pid::from_raw(
                        child.id().ok_or_else(|| anyhow::anyhow!("Failed to get stray PID"))? as i32,
                    );
                    self.strays.push(StrayProcess { pid, child });
                    return Ok(pid);
                }
                Err(e) => {
                    last_error = Some(e);
                    sleep(Duration::from_millis(50)).await;
                }
            }
        }

        Err(anyhow::anyhow!(
            "Failed to spawn stray {}: {:?}",
            executable.display(),
            last_error
        ))
    }

    /// Waits for a planted stray to be reaped.
    pub async fn wait_for_stray(&mut self, pid: Pid, limit: Duration) -> Result<Option<ExitStatus>> {
        let stray = self
            .strays
            .iter_mut()
            .find(|stray| stray.pid == pid)
            .ok_or_else(|| anyhow::anyhow!("Unknown stray pid {}", pid))?;
        match timeout(limit, stray.child.wait()).await {
            Ok(result) => Ok(Some(result.context("Stray wait failed")?)),
            Err(_) => Ok(None),
        }
    }
}

impl Drop for ServerHarness {
    fn drop(&mut self) {
        for stray in &self.strays {
            let _ = nix::sys::signal::kill(stray.pid, Signal::SIGKILL);
        }
    }
}

struct StrayProcess {
    pid: Pid,
    child: Child,
}

/// Waits until a server answers the client handshake on `port`.
pub async fn wait_until_serving(port: u16, limit: Duration) -> Result<()> {
    let target = ProbeTarget::new(SocketAddr::new(LOOPBACK, port));
    let deadline = Instant::now() + limit;
    loop {
        match NatsProbe::new().probe(&target).await {
            Ok(()) => return Ok(()),
            Err(e) if Instant::now() >= deadline => {
                return Err(anyhow::anyhow!("Nothing serving on port {} after {:?}: {}", port, limit, e))
            }
            Err(_) => sleep(Duration::from_millis(25)).await,
        }
    }
}

/// True while a process with `pid` exists and is not a zombie.
pub fn is_process_alive(pid: Pid) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) else {
        return false;
    };
    stat.rsplit_once(')')
        .and_then(|(_, rest)| rest.split_whitespace().next())
        .map(|state| state != "Z" && state != "X")
        .unwrap_or(false)
}
