use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tracing::debug;

pub use nix::sys::signal::Signal;

/// Signal asking a running server to drain and exit (lame duck mode).
pub const LAME_DUCK: Signal = Signal::SIGUSR2;

/// Signal asking a running server to close cleanly.
pub const GRACEFUL_STOP: Signal = Signal::SIGTERM;

/// Sends `signal` to the process group led by `pid`.
///
/// Servers are spawned as group leaders, so this also reaches any helpers they
/// forked. Returns `Ok(false)` when the group no longer exists.
pub fn signal_group(pid: Pid, signal: Signal) -> nix::Result<bool> {
    debug!("Sending signal {:?} to process group {}", signal, pid);
    deliver(Pid::from_raw(-pid.as_raw()), signal)
}

/// Sends `signal` to a single process. Returns `Ok(false)` when it no longer exists.
pub fn signal_process(pid: Pid, signal: Signal) -> nix::Result<bool> {
    debug!("Sending signal {:?} to process {}", signal, pid);
    deliver(pid, signal)
}

fn deliver(target: Pid, signal: Signal) -> nix::Result<bool> {
    match kill(target, signal) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(e) => Err(e),
    }
}
