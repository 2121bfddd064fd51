//! Error types for the supervisor, the barrier and the transient-failure marker.
//!
//! - [`SupervisorError`] is returned by supervisor operations and aborts the enclosing test.
//! - [`ProcessShutdownError`] is only ever logged; teardown never fails a test.
//! - [`BarrierError`] separates a timed-out wait from a wait on a disposed barrier.
//! - [`NoServersAvailable`] is the transient error the default retry policy recognizes.

use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Errors produced by [`crate::supervisor::ProcessSupervisor`].
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum SupervisorError {
    /// Every readiness probe failed; the spawned process has been shut down.
    #[error("server on port {port} failed startup verification after {attempts} probes: {last_error}")]
    StartupVerificationFailed {
        port: u16,
        attempts: u32,
        last_error: String,
    },

    /// Another live handle already owns the port.
    #[error("port {0} is already owned by a running server")]
    PortInUse(u16),

    #[error("failed to spawn {executable}: {source}")]
    Spawn {
        executable: String,
        #[source]
        source: std::io::Error,
    },

    /// The operation needs a running process.
    #[error("server on port {0} is not running")]
    NotRunning(u16),

    #[error("failed to signal server process: {0}")]
    Signal(#[from] nix::Error),

    #[error("failed to wait for server process: {0}")]
    Wait(#[source] std::io::Error),

    #[error("failed to scan the process table: {0}")]
    ProcessScan(#[source] std::io::Error),
}

impl SupervisorError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            SupervisorError::StartupVerificationFailed { .. } => "startup_verification_failed",
            SupervisorError::PortInUse(_) => "port_in_use",
            SupervisorError::Spawn { .. } => "spawn_failed",
            SupervisorError::NotRunning(_) => "not_running",
            SupervisorError::Signal(_) => "signal_failed",
            SupervisorError::Wait(_) => "wait_failed",
            SupervisorError::ProcessScan(_) => "process_scan_failed",
        }
    }
}

/// Failures during teardown. Logged at `warn`, never propagated.
#[derive(Error, Debug)]
pub enum ProcessShutdownError {
    #[error("failed to deliver {signal} to pid {pid}: {source}")]
    Signal {
        pid: i32,
        signal: nix::sys::signal::Signal,
        #[source]
        source: nix::Error,
    },

    #[error("failed to reap pid {pid}: {source}")]
    Reap {
        pid: i32,
        #[source]
        source: std::io::Error,
    },
}

/// Errors produced by [`crate::barrier::ActorBarrier`] waits.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BarrierError {
    /// Fewer signals than required arrived before the timeout.
    #[error("barrier wait timed out after {timeout:?}: expected {expected} signals, observed {observed}")]
    Timeout {
        expected: u32,
        observed: u32,
        timeout: Duration,
    },

    /// The barrier was disposed before or during the wait.
    #[error("barrier has been disposed")]
    Disposed,
}

impl BarrierError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, BarrierError::Timeout { .. })
    }
}

/// No server was reachable at connect time.
///
/// This is the transient condition [`crate::retry_policy::RetryPolicy::default`]
/// treats as retryable: test bodies raise it when their client cannot reach the
/// supervised server.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("no servers available for connection at {addr}")]
pub struct NoServersAvailable {
    pub addr: SocketAddr,
}
