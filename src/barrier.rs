//! Rendezvous between asynchronous signal sources and a waiting test.
//!
//! Client callbacks fire on arbitrary threads; the test task needs to block
//! until a known number of them have happened. [`ActorBarrier`] counts signals
//! durably: a signal that arrives before anyone waits is kept, signals beyond
//! the capacity are kept for the next wait, and every wait consumes what it
//! observed.
//!
//! ```no_run
//! # async fn demo() -> Result<(), natsfix::BarrierError> {
//! use natsfix::ActorBarrier;
//!
//! let barrier = ActorBarrier::new(2);
//! for _ in 0..2 {
//!     let b = barrier.clone();
//!     std::thread::spawn(move || b.signal());
//! }
//! barrier.wait_for_all().await?;
//! # Ok(())
//! # }
//! ```

use crate::error::BarrierError;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, error};

/// Timeout applied by [`ActorBarrier::wait_for_all`] and [`ActorBarrier::wait_for_one`].
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Timeout applied by [`ActorBarrier::wait_for_all_patiently`].
pub const PATIENT_TIMEOUT: Duration = Duration::from_millis(2000);

/// Timeout behavior of a barrier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierConfig {
    pub timeout: Duration,
    pub patient_timeout: Duration,
    /// Wait forever, e.g. while stepping through a test in a debugger
    pub disable_timeout: bool,
}

impl Default for BarrierConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            patient_timeout: PATIENT_TIMEOUT,
            disable_timeout: false,
        }
    }
}

#[derive(Debug)]
struct Inner {
    capacity: u32,
    config: BarrierConfig,
    permits: Semaphore,
    signaled: AtomicU64,
    consumed: AtomicU64,
    disposed: AtomicBool,
}

/// Counting rendezvous for `capacity` signal sources.
///
/// Cloning is cheap and every clone refers to the same barrier.
#[derive(Debug, Clone)]
pub struct ActorBarrier {
    inner: Arc<Inner>,
}

impl ActorBarrier {
    /// Creates a barrier that needs `capacity` signals per [`Self::wait_for_all`].
    ///
    /// # Panics
    /// If `capacity` is zero.
    pub fn new(capacity: u32) -> Self {
        Self::with_config(capacity, BarrierConfig::default())
    }

    pub fn with_config(capacity: u32, config: BarrierConfig) -> Self {
        assert!(capacity > 0, "barrier capacity must be positive");
        Self {
            inner: Arc::new(Inner {
                capacity,
                config,
                permits: Semaphore::new(0),
                signaled: AtomicU64::new(0),
                consumed: AtomicU64::new(0),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.inner.capacity
    }

    /// Records one signal. Callable from any thread, with or without a runtime.
    pub fn signal(&self) {
        self.inner.signaled.fetch_add(1, Ordering::Relaxed);
        self.inner.permits.add_permits(1);
    }

    /// Signals received since creation
    pub fn signaled(&self) -> u64 {
        self.inner.signaled.load(Ordering::Relaxed)
    }

    /// Signals consumed by completed waits since creation
    pub fn consumed(&self) -> u64 {
        self.inner.consumed.load(Ordering::Relaxed)
    }

    /// Signals received but not yet consumed
    pub fn pending(&self) -> usize {
        self.inner.permits.available_permits()
    }

    /// Waits for `capacity` signals using the default timeout.
    pub async fn wait_for_all(&self) -> Result<(), BarrierError> {
        self.wait(self.inner.capacity, self.inner.config.timeout).await
    }

    /// Waits for `capacity` signals using the longer patient timeout.
    pub async fn wait_for_all_patiently(&self) -> Result<(), BarrierError> {
        self.wait(self.inner.capacity, self.inner.config.patient_timeout)
            .await
    }

    pub async fn wait_for_all_within(&self, limit: Duration) -> Result<(), BarrierError> {
        self.wait(self.inner.capacity, limit).await
    }

    /// Waits for a single signal using the default timeout.
    pub async fn wait_for_one(&self) -> Result<(), BarrierError> {
        self.wait(1, self.inner.config.timeout).await
    }

    pub async fn wait_for_one_within(&self, limit: Duration) -> Result<(), BarrierError> {
        self.wait(1, limit).await
    }

    /// Releases the barrier. Pending and future waits fail with [`BarrierError::Disposed`].
    pub fn dispose(&self) {
        if !self.inner.disposed.swap(true, Ordering::AcqRel) {
            debug!("Disposing barrier with capacity {}", self.inner.capacity);
            self.inner.permits.close();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    async fn wait(&self, count: u32, limit: Duration) -> Result<(), BarrierError> {
        if self.is_disposed() {
            error!("Wait on a disposed barrier");
            return Err(BarrierError::Disposed);
        }

        // One permit at a time, so a waiter needing many signals never holds
        // back concurrent waiters that need fewer.
        let mut taken: u32 = 0;
        let acquire = async {
            while taken < count {
                let permit = self
                    .inner
                    .permits
                    .acquire()
                    .await
                    .map_err(|_| BarrierError::Disposed)?;
                permit.forget();
                taken += 1;
            }
            Ok::<(), BarrierError>(())
        };

        let acquired = if self.inner.config.disable_timeout {
            Some(acquire.await)
        } else {
            timeout(limit, acquire).await.ok()
        };

        match acquired {
            Some(Ok(())) => {
                self.inner.consumed.fetch_add(count as u64, Ordering::Relaxed);
                Ok(())
            }
            Some(Err(e)) => Err(e),
            None => {
                // Give back what this wait took; a failed wait consumes nothing
                self.inner.permits.add_permits(taken as usize);
                debug!("Barrier wait timed out: expected {}, observed {}", count, taken);
                Err(BarrierError::Timeout {
                    expected: count,
                    observed: taken,
                    timeout: limit,
                })
            }
        }
    }
}
