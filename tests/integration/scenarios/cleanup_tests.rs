use crate::integration::infrastructure::{fast_config, is_process_alive, ServerHarness};
use anyhow::Result;
use natsfix::ProcessSupervisor;
use std::os::unix::process::ExitStatusExt;
use std::time::{Duration, Instant};

// Every test plants strays under its own executable name, so cleanups never
// reach servers that other tests are running.

#[tokio::test]
async fn test_cleanup_kills_stray_servers() -> Result<()> {
    let mut harness = ServerHarness::new()?;
    let exe = harness.renamed_stub("stray-kill")?;
    let first = harness.spawn_stray(&exe).await?;
    let second = harness.spawn_stray(&exe).await?;
    assert!(is_process_alive(first) && is_process_alive(second));

    let supervisor = ProcessSupervisor::new(fast_config(&exe));
    let report = supervisor.global_cleanup().await?;

    assert!(report.is_clean(), "survivors: {:?}", report.survivors);
    assert!(report.killed.contains(&first));
    assert!(report.killed.contains(&second));

    for pid in [first, second] {
        let status = harness
            .wait_for_stray(pid, Duration::from_secs(5))
            .await?
            .expect("stray should be reaped after cleanup");
        assert_eq!(status.signal(), Some(nix::sys::signal::Signal::SIGKILL as i32));
    }
    Ok(())
}

#[tokio::test]
async fn test_cleanup_without_strays_returns_fast() -> Result<()> {
    let harness = ServerHarness::new()?;
    let supervisor = ProcessSupervisor::new(fast_config(harness.temp_path().join("no-such-srv")));

    let started = Instant::now();
    let report = supervisor.global_cleanup().await?;
    assert!(report.killed.is_empty());
    assert!(report.is_clean());
    assert!(started.elapsed() < Duration::from_millis(500));

    // running it again changes nothing
    let report = supervisor.global_cleanup().await?;
    assert!(report.killed.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_cleanup_once_runs_once_per_name() -> Result<()> {
    let mut harness = ServerHarness::new()?;
    let exe = harness.renamed_stub("stray-once")?;
    let supervisor = ProcessSupervisor::new(fast_config(&exe));

    let early = harness.spawn_stray(&exe).await?;
    let report = supervisor
        .cleanup_once()
        .await?
        .expect("first cleanup for this name does the work");
    assert!(report.killed.contains(&early));

    let late = harness.spawn_stray(&exe).await?;
    assert!(supervisor.cleanup_once().await?.is_none());
    assert!(is_process_alive(late), "second cleanup_once must not touch processes");

    let report = supervisor.global_cleanup().await?;
    assert!(report.killed.contains(&late));
    Ok(())
}

#[tokio::test]
async fn test_cleanup_leaves_other_executables_alone() -> Result<()> {
    let mut harness = ServerHarness::new()?;
    let keep = harness.renamed_stub("stray-keep")?;
    let target = harness.renamed_stub("stray-target")?;
    let kept = harness.spawn_stray(&keep).await?;
    let doomed = harness.spawn_stray(&target).await?;

    let report = ProcessSupervisor::new(fast_config(&target))
        .global_cleanup()
        .await?;
    assert_eq!(report.killed, vec![doomed]);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(is_process_alive(kept));
    Ok(())
}
