//! Stray-process cleanup run once before any server is started.
//!
//! A crashed test run can leave server instances behind that still hold ports.
//! [`global_cleanup`] finds every live process whose command name matches the
//! server executable and force-terminates it, then polls with linear backoff
//! until the process table is clear.

use crate::error::SupervisorError;
use crate::signals::{signal_process, Signal};
use nix::unistd::Pid;
use once_cell::sync::Lazy;
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Kernel limit on `/proc/<pid>/comm` (TASK_COMM_LEN - 1).
const COMM_LEN: usize = 15;

/// Executable names already cleaned up by this process.
static CLEANED: Lazy<Mutex<HashSet<String>>> = Lazy::new(|| Mutex::new(HashSet::new()));

/// Outcome of a cleanup pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Processes that were sent SIGKILL
    pub killed: Vec<Pid>,
    /// Processes still alive after the last poll
    pub survivors: Vec<Pid>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.survivors.is_empty()
    }
}

/// Force-terminates every live process named `name` and waits until none remain.
///
/// Polls up to `attempts` times, waiting `i * step` after poll `i`. Returns
/// immediately when nothing matches. Survivors are reported, not raised.
pub async fn global_cleanup(
    name: &str,
    attempts: u32,
    step: Duration,
) -> Result<CleanupReport, SupervisorError> {
    let found = find_processes(name).await?;
    if found.is_empty() {
        debug!("No stray {} processes found", name);
        return Ok(CleanupReport::default());
    }

    info!("Killing {} stray {} process(es): {:?}", found.len(), name, found);
    let mut report = CleanupReport::default();
    for pid in found {
        match signal_process(pid, Signal::SIGKILL) {
            Ok(true) => report.killed.push(pid),
            Ok(false) => debug!("Process {} exited before it could be killed", pid),
            Err(e) => warn!("Failed to kill stray process {}: {}", pid, e),
        }
    }

    for attempt in 1..=attempts {
        if find_processes(name).await?.is_empty() {
            info!("Stray {} processes cleaned up after {} poll(s)", name, attempt);
            return Ok(report);
        }
        sleep(step * attempt).await;
    }

    report.survivors = find_processes(name).await?;
    if !report.is_clean() {
        warn!(
            "{} stray {} process(es) survived cleanup: {:?}",
            report.survivors.len(),
            name,
            report.survivors
        );
    }
    Ok(report)
}

/// Runs [`global_cleanup`] at most once per executable name in this process.
///
/// Returns `None` when the name was already cleaned up earlier.
pub async fn cleanup_once(
    name: &str,
    attempts: u32,
    step: Duration,
) -> Result<Option<CleanupReport>, SupervisorError> {
    let mut cleaned = CLEANED.lock().await;
    if cleaned.contains(name) {
        return Ok(None);
    }

    let report = global_cleanup(name, attempts, step).await?;
    cleaned.insert(name.to_string());
    Ok(Some(report))
}

/// Lists live, non-zombie processes whose command name is `name`, excluding this process.
#[cfg(target_os = "linux")]
pub async fn find_processes(name: &str) -> Result<Vec<Pid>, SupervisorError> {
    let wanted: String = name.chars().take(COMM_LEN).collect();
    let own_pid = std::process::id() as i32;

    let mut entries = tokio::fs::read_dir("/proc")
        .await
        .map_err(SupervisorError::ProcessScan)?;

    let mut found = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(SupervisorError::ProcessScan)?
    {
        let Ok(pid) = entry.file_name().to_string_lossy().parse::<i32>() else {
            continue;
        };
        if pid == own_pid {
            continue;
        }

        // Processes can vanish between listing and reading
        let Ok(comm) = tokio::fs::read_to_string(format!("/proc/{}/comm", pid)).await else {
            continue;
        };
        if comm.trim_end() != wanted {
            continue;
        }
        if is_zombie(pid).await {
            continue;
        }
        found.push(Pid::from_raw(pid));
    }

    Ok(found)
}

#[cfg(target_os = "linux")]
async fn is_zombie(pid: i32) -> bool {
    // State is the first field after the parenthesised command name in /proc/<pid>/stat
    match tokio::fs::read_to_string(format!("/proc/{}/stat", pid)).await {
        Ok(stat) => stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.split_whitespace().next())
            .map(|state| state == "Z" || state == "X")
            .unwrap_or(false),
        Err(_) => true,
    }
}

/// Lists processes named `name` with `pgrep` on platforms without procfs.
#[cfg(not(target_os = "linux"))]
pub async fn find_processes(name: &str) -> Result<Vec<Pid>, SupervisorError> {
    let output = tokio::process::Command::new("pgrep")
        .arg("-x")
        .arg(name)
        .output()
        .await
        .map_err(SupervisorError::ProcessScan)?;

    let own_pid = std::process::id() as i32;
    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(|line| line.trim().parse::<i32>().ok())
        .filter(|pid| *pid != own_pid)
        .map(Pid::from_raw)
        .collect())
}
