use crate::integration::infrastructure::{free_port, init_tracing, ServerHarness};
use anyhow::Result;
use natsfix::{ActorBarrier, BarrierConfig, BarrierError, ServerArgs};
use std::thread;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

/// Callbacks from client connections on spawned tasks release the barrier.
#[tokio::test]
async fn test_barrier_waits_for_connection_callbacks() -> Result<()> {
    let harness = ServerHarness::new()?;
    let supervisor = harness.supervisor();
    let port = free_port()?;
    let mut handle = supervisor
        .start_and_verify(port, ServerArgs::new(), Duration::from_millis(500))
        .await?;

    let clients = 3;
    let barrier = ActorBarrier::new(clients);
    for _ in 0..clients {
        let barrier = barrier.clone();
        let addr = handle.addr();
        tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await?;
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await?;
            if &buf == b"INFO" {
                barrier.signal();
            }
            Ok::<_, std::io::Error>(())
        });
    }

    barrier.wait_for_all_patiently().await?;
    assert_eq!(barrier.consumed(), clients as u64);

    supervisor.shutdown(&mut handle).await;
    Ok(())
}

#[tokio::test]
async fn test_barrier_reports_missing_thread_signal() {
    init_tracing();
    let barrier = ActorBarrier::with_config(
        3,
        BarrierConfig {
            timeout: Duration::from_millis(200),
            ..Default::default()
        },
    );

    let workers: Vec<_> = (0..2)
        .map(|_| {
            let barrier = barrier.clone();
            thread::spawn(move || barrier.signal())
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let err = barrier.wait_for_all().await.unwrap_err();
    assert_eq!(
        err,
        BarrierError::Timeout {
            expected: 3,
            observed: 2,
            timeout: Duration::from_millis(200),
        }
    );

    // the partial signals are still there for the next wait
    barrier.signal();
    barrier.wait_for_all().await.unwrap();
    barrier.dispose();
    assert_eq!(barrier.wait_for_one().await, Err(BarrierError::Disposed));
}
