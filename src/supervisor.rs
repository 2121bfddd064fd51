use crate::cleanup::{self, CleanupReport};
use crate::error::{ProcessShutdownError, SupervisorError};
use crate::ports::{is_port_free, LOOPBACK};
use crate::probe::{NatsProbe, ProbeTarget, ReadinessProbe};
use crate::server_args::{lame_duck_signal_args, ServerArgs};
use crate::signals::{signal_group, signal_process, Signal, GRACEFUL_STOP, LAME_DUCK};
use chrono::{DateTime, Utc};
use nix::unistd::Pid;
use once_cell::sync::Lazy;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Mutex;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// Per-probe connect timeout used when the caller does not pass one.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Upper bound on reaping a process after SIGKILL.
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for supervising server processes
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Server executable, either a path or a name looked up on PATH
    pub executable: PathBuf,
    /// Run the server with verbose logging and its output attached
    pub debug_mode: bool,
    /// Never attach server output to the console
    pub hide_window: bool,
    /// Skip teardown so the server can be inspected after the test
    pub leave_running: bool,
    /// Readiness probes before startup verification fails
    pub probe_attempts: u32,
    /// Probe attempt `i` waits `i * probe_backoff_step` before retrying
    pub probe_backoff_step: Duration,
    /// Per-probe timeout for restarts done by `bounce`
    pub probe_timeout: Duration,
    /// How long a graceful stop may take before the process is killed
    pub graceful_shutdown_timeout: Duration,
    /// Polls of the process table during stray-process cleanup
    pub cleanup_attempts: u32,
    /// Cleanup poll `i` waits `i * cleanup_backoff_step`
    pub cleanup_backoff_step: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("nats-server"),
            debug_mode: false,
            hide_window: false,
            leave_running: false,
            probe_attempts: 10,
            probe_backoff_step: Duration::from_millis(250),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            graceful_shutdown_timeout: Duration::from_millis(250),
            cleanup_attempts: 10,
            cleanup_backoff_step: Duration::from_millis(250),
        }
    }
}

impl SupervisorConfig {
    /// Command name the server shows up under in the process table.
    pub fn process_name(&self) -> String {
        self.executable
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.executable.display().to_string())
    }
}

/// Lifecycle state of a supervised server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Spawned, readiness not yet established
    Starting,
    /// Verified (or settled) and serving
    Running,
    /// A stop has been requested
    ShuttingDown,
    /// The process has exited or been released
    Stopped,
}

/// Ports owned by live handles of any supervisor in this process.
static OWNED_PORTS: Lazy<Mutex<HashSet<u16>>> = Lazy::new(|| Mutex::new(HashSet::new()));

/// Exclusive claim on a port, released on drop.
#[derive(Debug)]
struct PortLease {
    port: u16,
}

impl PortLease {
    fn acquire(port: u16) -> Result<Self, SupervisorError> {
        let mut owned = OWNED_PORTS.lock().unwrap_or_else(|e| e.into_inner());
        if !owned.insert(port) {
            return Err(SupervisorError::PortInUse(port));
        }
        Ok(Self { port })
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        let mut owned = OWNED_PORTS.lock().unwrap_or_else(|e| e.into_inner());
        owned.remove(&self.port);
    }
}

fn is_port_owned(port: u16) -> bool {
    OWNED_PORTS
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .contains(&port)
}

/// One spawned server process bound to a port.
///
/// The handle owns the port for as long as it lives. Dropping a handle whose
/// process is still running kills the whole process group, so a failing test
/// never leaks a server.
#[derive(Debug)]
pub struct ServerProcessHandle {
    port: u16,
    args: ServerArgs,
    state: ProcessState,
    pid: Option<Pid>,
    child: Option<Child>,
    started_at: DateTime<Utc>,
    exit_status: Option<ExitStatus>,
    leave_running: bool,
    lease: Option<PortLease>,
}

impl ServerProcessHandle {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(LOOPBACK, self.port)
    }

    pub fn args(&self) -> &ServerArgs {
        &self.args
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// Pid of the current (or last) server process
    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Exit status, once the process has been reaped
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    /// Checks the OS whether the process is still alive.
    pub fn is_alive(&mut self) -> bool {
        match self.child {
            Some(ref mut child) => match child.try_wait() {
                Ok(None) => true,
                Ok(Some(status)) => {
                    self.exit_status = Some(status);
                    false
                }
                Err(_) => false,
            },
            None => false,
        }
    }

    fn attach(&mut self, child: Child, pid: Pid) {
        self.child = Some(child);
        self.pid = Some(pid);
        self.state = ProcessState::Starting;
        self.started_at = Utc::now();
        self.exit_status = None;
    }

    /// Stops the process: graceful stop first, SIGKILL after `grace`.
    ///
    /// Always drops the child handle. Errors are logged, never returned.
    async fn terminate(&mut self, grace: Duration) {
        let Some(mut child) = self.child.take() else {
            self.state = ProcessState::Stopped;
            return;
        };
        let pid = match self.pid {
            Some(pid) => pid,
            None => {
                self.state = ProcessState::Stopped;
                return;
            }
        };

        if let Ok(Some(status)) = child.try_wait() {
            debug!("Server on port {} (pid {}) already exited: {:?}", self.port, pid, status);
            self.exit_status = Some(status);
            self.state = ProcessState::Stopped;
            return;
        }

        self.state = ProcessState::ShuttingDown;
        info!("Initiating graceful shutdown of server on port {} (pid {})", self.port, pid);

        if let Err(e) = send_for_shutdown(pid, GRACEFUL_STOP) {
            warn!("{}", e);
        }

        match timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                info!("Server on port {} exited gracefully: {:?}", self.port, status);
                self.exit_status = Some(status);
            }
            Ok(Err(source)) => {
                warn!("{}", ProcessShutdownError::Reap { pid: pid.as_raw(), source });
                self.exit_status = force_kill(pid, &mut child).await;
            }
            Err(_) => {
                warn!("Graceful shutdown timeout on port {}, forcing kill", self.port);
                self.exit_status = force_kill(pid, &mut child).await;
            }
        }

        self.state = ProcessState::Stopped;
    }
}

impl Drop for ServerProcessHandle {
    fn drop(&mut self) {
        if self.leave_running {
            return;
        }
        // Emergency cleanup: handle dropped without shutdown, e.g. a panicking test
        if let Some(pid) = self.pid {
            if self.state == ProcessState::Running
                || self.state == ProcessState::Starting
                || self.state == ProcessState::ShuttingDown
            {
                warn!("Server handle for port {} dropped with live process (pid {}), killing", self.port, pid);
                if let Err(e) = send_for_shutdown(pid, Signal::SIGKILL) {
                    warn!("{}", e);
                }
            }
        }
    }
}

fn send_for_shutdown(pid: Pid, signal: Signal) -> Result<(), ProcessShutdownError> {
    signal_group(pid, signal)
        .map(|_| ())
        .map_err(|source| ProcessShutdownError::Signal {
            pid: pid.as_raw(),
            signal,
            source,
        })
}

async fn force_kill(pid: Pid, child: &mut Child) -> Option<ExitStatus> {
    info!("Force killing server process group {}", pid);
    if let Err(e) = send_for_shutdown(pid, Signal::SIGKILL) {
        warn!("{}", e);
    }

    match timeout(KILL_REAP_TIMEOUT, child.wait()).await {
        Ok(Ok(status)) => Some(status),
        Ok(Err(source)) => {
            warn!("{}", ProcessShutdownError::Reap { pid: pid.as_raw(), source });
            None
        }
        Err(_) => {
            warn!("Process {} not reaped {:?} after SIGKILL", pid, KILL_REAP_TIMEOUT);
            None
        }
    }
}

/// Starts, verifies, restarts, signals and tears down server processes.
///
/// Port ownership is tracked process-wide: starting a server on a port that a
/// live handle of any supervisor owns, or that some other process is already
/// listening on, fails with [`SupervisorError::PortInUse`].
#[derive(Clone)]
pub struct ProcessSupervisor<P = NatsProbe> {
    config: SupervisorConfig,
    probe: P,
}

impl ProcessSupervisor<NatsProbe> {
    pub fn new(config: SupervisorConfig) -> Self {
        Self::with_probe(config, NatsProbe::new())
    }
}

impl<P: ReadinessProbe> ProcessSupervisor<P> {
    /// Creates a supervisor that checks readiness with `probe`.
    pub fn with_probe(config: SupervisorConfig, probe: P) -> Self {
        Self { config, probe }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Spawns a server on `port` and waits until a client can connect to it.
    ///
    /// Probes up to `probe_attempts` times, each bounded by `probe_timeout`;
    /// after failed attempt `i` it waits `i * probe_backoff_step`. When every
    /// probe fails the process is shut down and
    /// [`SupervisorError::StartupVerificationFailed`] is returned.
    pub async fn start_and_verify(
        &self,
        port: u16,
        args: ServerArgs,
        probe_timeout: Duration,
    ) -> Result<ServerProcessHandle, SupervisorError> {
        let mut handle = self.spawn(port, args)?;
        match self.verify(&mut handle, probe_timeout).await {
            Ok(()) => Ok(handle),
            Err(e) => {
                self.shutdown(&mut handle).await;
                Err(e)
            }
        }
    }

    /// Spawns a server on `port` without verification and waits `settle_delay`.
    pub async fn start(
        &self,
        port: u16,
        args: ServerArgs,
        settle_delay: Duration,
    ) -> Result<ServerProcessHandle, SupervisorError> {
        let mut handle = self.spawn(port, args)?;
        sleep(settle_delay).await;
        handle.state = ProcessState::Running;
        info!("Server on port {} assumed ready after {:?}", port, settle_delay);
        Ok(handle)
    }

    /// Stops the server and releases its process and port.
    ///
    /// Idempotent and infallible: an already-exited process is only reaped,
    /// and any failure on the way is logged.
    pub async fn shutdown(&self, handle: &mut ServerProcessHandle) {
        if self.config.leave_running {
            if let Some(pid) = handle.pid {
                info!("Leaving server on port {} (pid {}) running for inspection", handle.port, pid);
            }
            return;
        }

        handle.terminate(self.config.graceful_shutdown_timeout).await;
        handle.lease = None;
    }

    /// Stops the server, waits `downtime`, then starts it again on the same
    /// port with the same arguments and verifies readiness.
    pub async fn bounce(
        &self,
        handle: &mut ServerProcessHandle,
        downtime: Duration,
    ) -> Result<(), SupervisorError> {
        info!("Bouncing server on port {} for {:?}", handle.port, downtime);
        if handle.lease.is_none() {
            handle.lease = Some(PortLease::acquire(handle.port)?);
        }

        handle.terminate(self.config.graceful_shutdown_timeout).await;
        sleep(downtime).await;

        let (child, pid) = self.spawn_child(handle.port, &handle.args)?;
        handle.attach(child, pid);
        self.verify(handle, self.config.probe_timeout).await
    }

    /// Asks a running server to enter lame duck mode and waits, without a
    /// timeout, until it has drained and exited.
    ///
    /// The request goes through the server executable (`--signal ldm=<pid>`);
    /// if that helper fails, the lame duck signal is sent directly.
    pub async fn set_lame_duck_mode(
        &self,
        handle: &mut ServerProcessHandle,
    ) -> Result<ExitStatus, SupervisorError> {
        let port = handle.port;
        if handle.state != ProcessState::Running {
            return Err(SupervisorError::NotRunning(port));
        }
        let (Some(pid), Some(child)) = (handle.pid, handle.child.as_mut()) else {
            return Err(SupervisorError::NotRunning(port));
        };

        info!("Putting server on port {} (pid {}) into lame duck mode", port, pid);
        handle.state = ProcessState::ShuttingDown;
        if !self.request_lame_duck(pid).await && !signal_process(pid, LAME_DUCK)? {
            debug!("Server on port {} was already gone", port);
        }

        let status = child.wait().await.map_err(SupervisorError::Wait)?;
        info!("Server on port {} left lame duck mode: {:?}", port, status);

        handle.child = None;
        handle.exit_status = Some(status);
        handle.state = ProcessState::Stopped;
        Ok(status)
    }

    /// Kills every stray instance of the server executable.
    pub async fn global_cleanup(&self) -> Result<CleanupReport, SupervisorError> {
        cleanup::global_cleanup(
            &self.config.process_name(),
            self.config.cleanup_attempts,
            self.config.cleanup_backoff_step,
        )
        .await
    }

    /// Like [`Self::global_cleanup`], but only the first call per executable
    /// name in this process does any work.
    pub async fn cleanup_once(&self) -> Result<Option<CleanupReport>, SupervisorError> {
        cleanup::cleanup_once(
            &self.config.process_name(),
            self.config.cleanup_attempts,
            self.config.cleanup_backoff_step,
        )
        .await
    }

    /// Runs `<executable> --signal ldm=<pid>`. Returns false if it did not succeed.
    async fn request_lame_duck(&self, pid: Pid) -> bool {
        let mut command = Command::new(&self.config.executable);
        command
            .args(lame_duck_signal_args(pid.as_raw()))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut helper = match command.spawn() {
            Ok(helper) => helper,
            Err(e) => {
                warn!("Failed to spawn lame duck signal helper: {}", e);
                return false;
            }
        };
        match timeout(KILL_REAP_TIMEOUT, helper.wait()).await {
            Ok(Ok(status)) if status.success() => true,
            Ok(Ok(status)) => {
                warn!("Lame duck signal helper for pid {} exited with {}", pid, status);
                false
            }
            Ok(Err(e)) => {
                warn!("Failed to wait for lame duck signal helper: {}", e);
                false
            }
            Err(_) => {
                warn!("Lame duck signal helper for pid {} timed out", pid);
                false
            }
        }
    }

    fn spawn(&self, port: u16, args: ServerArgs) -> Result<ServerProcessHandle, SupervisorError> {
        let lease = PortLease::acquire(port)?;
        if !is_port_free(LOOPBACK, port) {
            warn!("Port {} is already bound by a process outside this supervisor", port);
            return Err(SupervisorError::PortInUse(port));
        }
        let (child, pid) = self.spawn_child(port, &args)?;

        Ok(ServerProcessHandle {
            port,
            args,
            state: ProcessState::Starting,
            pid: Some(pid),
            child: Some(child),
            started_at: Utc::now(),
            exit_status: None,
            leave_running: self.config.leave_running,
            lease: Some(lease),
        })
    }

    fn spawn_child(&self, port: u16, args: &ServerArgs) -> Result<(Child, Pid), SupervisorError> {
        let mut argv = args.to_args(port);
        if self.config.debug_mode && !args.verbose {
            argv.push("-DV".to_string());
        }
        info!("Spawning server: {} {}", self.config.executable.display(), argv.join(" "));

        let mut command = Command::new(&self.config.executable);
        command.args(&argv);

        // Own process group, so teardown reaches everything the server forks
        command.process_group(0);
        command.kill_on_drop(!self.config.leave_running);
        command.stdin(Stdio::null());
        if self.config.debug_mode && !self.config.hide_window {
            command.stdout(Stdio::inherit());
            command.stderr(Stdio::inherit());
        } else {
            command.stdout(Stdio::null());
            command.stderr(Stdio::null());
        }

        let spawn_error = |source| SupervisorError::Spawn {
            executable: self.config.executable.display().to_string(),
            source,
        };
        let child = command.spawn().map_err(spawn_error)?;
        let pid = child
            .id()
            .map(|id| Pid::from_raw(id as i32))
            .ok_or_else(|| spawn_error(std::io::Error::other("spawned process has no pid")))?;

        info!("Server spawned on port {} with PID: {}", port, pid);
        Ok((child, pid))
    }

    async fn verify(
        &self,
        handle: &mut ServerProcessHandle,
        probe_timeout: Duration,
    ) -> Result<(), SupervisorError> {
        let target = ProbeTarget::new(handle.addr()).with_auth_token(handle.args.auth_token.clone());
        let attempts = self.config.probe_attempts.max(1);
        let mut last_error = String::new();
        let mut exit_reported = false;

        for attempt in 1..=attempts {
            match timeout(probe_timeout, self.probe.probe(&target)).await {
                Ok(Ok(())) if !handle.is_alive() => {
                    // Someone else answered on the port while our server died
                    warn!(
                        "Server on port {} exited ({:?}) but the port still answers",
                        handle.port, handle.exit_status
                    );
                    return Err(SupervisorError::StartupVerificationFailed {
                        port: handle.port,
                        attempts: attempt,
                        last_error: format!(
                            "spawned server exited; port {} is served by another process",
                            handle.port
                        ),
                    });
                }
                Ok(Ok(())) => {
                    handle.state = ProcessState::Running;
                    info!("Server on port {} ready after {} probe(s)", handle.port, attempt);
                    return Ok(());
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = format!("probe timed out after {:?}", probe_timeout),
            }
            debug!(
                "Readiness probe {}/{} on port {} failed: {}",
                attempt, attempts, handle.port, last_error
            );

            if !exit_reported && !handle.is_alive() {
                warn!(
                    "Server process on port {} exited during startup: {:?}",
                    handle.port, handle.exit_status
                );
                exit_reported = true;
            }
            if attempt < attempts {
                sleep(self.config.probe_backoff_step * attempt).await;
            }
        }

        Err(SupervisorError::StartupVerificationFailed {
            port: handle.port,
            attempts,
            last_error,
        })
    }
}
