use crate::integration::infrastructure::{delayed_start, free_port, ServerHarness};
use anyhow::Result;
use natsfix::report::RecordingSink;
use natsfix::{
    Disposition, NatsProbe, NoServersAvailable, ProbeTarget, ReadinessProbe, ReportMessage, RetryPolicy,
    RetryableTestRunner, ServerArgs, TestFailure, MAX_ATTEMPTS,
};
use std::any::type_name;
use std::net::SocketAddr;
use std::time::Duration;

const RECONNECT_DELAY: Duration = Duration::from_millis(800);

/// Connects the way a client under test would, failing with the transient
/// error when nothing answers.
async fn connect(addr: SocketAddr) -> Result<(), TestFailure> {
    match NatsProbe::new().probe(&ProbeTarget::new(addr)).await {
        Ok(()) => Ok(()),
        Err(_) => Err(NoServersAvailable { addr }.into()),
    }
}

fn runner(sink: &RecordingSink) -> RetryableTestRunner<RecordingSink> {
    RetryableTestRunner::new(RetryPolicy::default(), sink.clone())
}

#[tokio::test]
async fn test_retry_recovers_when_server_comes_up() -> Result<()> {
    let harness = ServerHarness::new()?;
    let supervisor = harness.supervisor();
    let port = free_port()?;

    // not verified, and the stub takes a while to bind
    let mut handle = supervisor
        .start(
            port,
            delayed_start(ServerArgs::new(), Duration::from_millis(300)),
            Duration::ZERO,
        )
        .await?;
    let addr = handle.addr();

    let sink = RecordingSink::new();
    let summary = runner(&sink)
        .run("publish_after_startup", |ctx| async move {
            if ctx.attempt() > 1 {
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
            connect(addr).await
        })
        .await;

    assert!(summary.passed(), "disposition: {:?}", summary.disposition);
    assert_eq!(summary.attempt_count(), 2);

    let messages = sink.messages();
    assert_eq!(messages.len(), 2);
    assert!(matches!(&messages[0], ReportMessage::Skipped { reason, .. } if reason.contains("1/2")));
    assert!(matches!(messages[1], ReportMessage::Passed { .. }));

    supervisor.shutdown(&mut handle).await;
    Ok(())
}

#[tokio::test]
async fn test_missing_server_fails_after_all_attempts() -> Result<()> {
    let _harness = ServerHarness::new()?;
    let addr = SocketAddr::new(natsfix::ports::LOOPBACK, free_port()?);

    let sink = RecordingSink::new();
    let summary = runner(&sink)
        .run("publish_without_server", |_ctx| async move { connect(addr).await })
        .await;

    assert_eq!(summary.attempt_count(), MAX_ATTEMPTS);
    match &summary.disposition {
        Disposition::Failed { causes } => {
            assert_eq!(causes.len(), 1);
            assert_eq!(causes[0].primary_type(), Some(type_name::<NoServersAvailable>()));
            assert!(causes[0].message.contains(&addr.to_string()));
        }
        other => panic!("expected failure, got {other:?}"),
    }

    let messages = sink.messages();
    assert_eq!(messages.len(), 2);
    assert!(matches!(messages[0], ReportMessage::Skipped { .. }));
    assert!(matches!(messages[1], ReportMessage::Failed { .. }));
    Ok(())
}

#[tokio::test]
async fn test_real_failure_against_live_server_is_not_retried() -> Result<()> {
    let harness = ServerHarness::new()?;
    let supervisor = harness.supervisor();
    let port = free_port()?;
    let mut handle = supervisor
        .start_and_verify(port, ServerArgs::new(), Duration::from_millis(500))
        .await?;
    let addr = handle.addr();

    let sink = RecordingSink::new();
    let summary = runner(&sink)
        .run("wrong_message_count", |_ctx| async move {
            connect(addr).await?;
            Err(TestFailure::new("assertion", "expected 2 messages, received 1"))
        })
        .await;

    assert!(summary.failed());
    assert_eq!(summary.attempt_count(), 1);
    assert_eq!(sink.messages().len(), 1);

    supervisor.shutdown(&mut handle).await;
    Ok(())
}
