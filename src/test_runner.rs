//! Retrying execution of a single test case.
//!
//! [`RetryableTestRunner::run`] executes a test body, captures its failures
//! instead of forwarding them, and decides from the [`RetryPolicy`] whether
//! the attempt is final. Attempts run strictly one after another. The host
//! sink sees one `Skipped` marker per failure of every retried attempt and
//! then exactly one final disposition.

use crate::report::{Disposition, FailureRecord, ReportMessage, ReportSink, TestId, TracingSink};
use crate::retry_policy::{RetryPolicy, MAX_ATTEMPTS};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::any::{type_name, Any};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Error type name recorded for a panicking test body.
pub const PANIC_TYPE: &str = "panic";

/// Reason reported when a run is cancelled before its attempt finished.
pub const CANCELLED_REASON: &str = "cancelled";

/// A failure raised by a test body.
///
/// Any `std::error::Error` converts into it with `?`, recording the concrete
/// error type name for retry classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestFailure {
    exception_types: Vec<String>,
    message: String,
}

impl TestFailure {
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            exception_types: vec![type_name.into()],
            message: message.into(),
        }
    }

    /// Records an inner cause type after the outer one.
    pub fn caused_by<E: 'static>(mut self) -> Self {
        self.exception_types.push(type_name::<E>().to_string());
        self
    }

    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "test body panicked".to_string()
        };
        Self::new(PANIC_TYPE, message)
    }

    pub fn exception_types(&self) -> &[String] {
        &self.exception_types
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    fn into_record(self, test: &TestId) -> FailureRecord {
        FailureRecord {
            test: test.clone(),
            exception_types: self.exception_types,
            message: self.message,
        }
    }
}

impl<E> From<E> for TestFailure
where
    E: std::error::Error + 'static,
{
    fn from(error: E) -> Self {
        let mut message = error.to_string();
        let mut source = error.source();
        while let Some(cause) = source {
            message.push_str(": ");
            message.push_str(&cause.to_string());
            source = cause.source();
        }
        Self::new(type_name::<E>(), message)
    }
}

impl fmt::Display for TestFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.exception_types.first() {
            Some(kind) => write!(f, "{}: {}", kind, self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Handed to the test body on every attempt.
#[derive(Debug, Clone)]
pub struct AttemptContext {
    test: TestId,
    attempt: u32,
    cancel: CancellationToken,
    captured: Arc<Mutex<Vec<FailureRecord>>>,
}

impl AttemptContext {
    pub fn test(&self) -> &TestId {
        &self.test
    }

    /// 1-based attempt index
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Records a failure without ending the attempt, e.g. from a callback or
    /// a cleanup step.
    pub fn record_failure(&self, failure: impl Into<TestFailure>) {
        let record = failure.into().into_record(&self.test);
        debug!("Captured failure for {} attempt {}: {}", self.test, self.attempt, record);
        self.captured
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record);
    }

    fn drain(&self) -> Vec<FailureRecord> {
        std::mem::take(&mut *self.captured.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

/// How a single attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Passed,
    Failed,
    Cancelled,
}

/// One execution of the test body.
#[derive(Debug, Clone)]
pub struct TestExecutionAttempt {
    /// 1-based, never above [`MAX_ATTEMPTS`]
    pub index: u32,
    pub failures: Vec<FailureRecord>,
    pub outcome: AttemptOutcome,
    pub elapsed: Duration,
}

/// Everything the runner knows about one `run` call.
#[derive(Debug, Clone)]
pub struct ExecutionSummary {
    pub invocation: Uuid,
    pub test: TestId,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub attempts: Vec<TestExecutionAttempt>,
    pub disposition: Disposition,
}

impl ExecutionSummary {
    pub fn passed(&self) -> bool {
        self.disposition == Disposition::Passed
    }

    pub fn failed(&self) -> bool {
        matches!(self.disposition, Disposition::Failed { .. })
    }

    pub fn skipped(&self) -> bool {
        matches!(self.disposition, Disposition::Skipped { .. })
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempts.len() as u32
    }
}

/// Runs test bodies and retries attempts that failed only transiently.
pub struct RetryableTestRunner<S = TracingSink> {
    policy: RetryPolicy,
    sink: S,
    cancel: CancellationToken,
}

impl Default for RetryableTestRunner<TracingSink> {
    fn default() -> Self {
        Self::new(RetryPolicy::default(), TracingSink)
    }
}

impl<S: ReportSink> RetryableTestRunner<S> {
    pub fn new(policy: RetryPolicy, sink: S) -> Self {
        Self {
            policy,
            sink,
            cancel: CancellationToken::new(),
        }
    }

    /// Uses `token` to cancel the run; a cancelled run is never retried.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Executes `body` until it passes, fails permanently, exhausts
    /// [`MAX_ATTEMPTS`] or the run is cancelled.
    pub async fn run<F, Fut>(&self, test: impl Into<TestId>, body: F) -> ExecutionSummary
    where
        F: Fn(AttemptContext) -> Fut,
        Fut: Future<Output = Result<(), TestFailure>>,
    {
        let test = test.into();
        let invocation = Uuid::new_v4();
        let started_at = Utc::now();
        let clock = Instant::now();
        let mut attempts: Vec<TestExecutionAttempt> = Vec::new();

        debug!("Running {} (invocation {})", test, invocation);

        let disposition = loop {
            let index = attempts.len() as u32 + 1;
            let attempt = self.execute(&test, index, &body).await;

            if attempt.failures.is_empty() || self.cancel.is_cancelled() {
                // A retry cancelled before it ran still fails with what the
                // retried attempt saw.
                let disposition = match attempts.last() {
                    Some(previous)
                        if attempt.outcome == AttemptOutcome::Cancelled && attempt.failures.is_empty() =>
                    {
                        Disposition::Failed {
                            causes: previous.failures.clone(),
                        }
                    }
                    _ => final_disposition(&attempt),
                };
                attempts.push(attempt);
                break disposition;
            }

            if !self.policy.allows_retry(&attempt.failures) {
                debug!("{} attempt {} failed permanently", test, index);
                let disposition = Disposition::Failed {
                    causes: attempt.failures.clone(),
                };
                attempts.push(attempt);
                break disposition;
            }

            if index >= MAX_ATTEMPTS {
                warn!("{} failed transiently on all {} attempts", test, MAX_ATTEMPTS);
                let disposition = Disposition::Failed {
                    causes: attempt.failures.clone(),
                };
                attempts.push(attempt);
                break disposition;
            }

            info!("{} attempt {}/{} failed transiently, retrying", test, index, MAX_ATTEMPTS);
            for failure in &attempt.failures {
                self.sink.report(ReportMessage::Skipped {
                    test: test.clone(),
                    reason: retry_reason(index, failure),
                });
            }
            attempts.push(attempt);
        };

        let elapsed = clock.elapsed();
        self.sink
            .report(ReportMessage::from_disposition(test.clone(), &disposition, elapsed));

        ExecutionSummary {
            invocation,
            test,
            started_at,
            elapsed,
            attempts,
            disposition,
        }
    }

    async fn execute<F, Fut>(&self, test: &TestId, index: u32, body: &F) -> TestExecutionAttempt
    where
        F: Fn(AttemptContext) -> Fut,
        Fut: Future<Output = Result<(), TestFailure>>,
    {
        let context = AttemptContext {
            test: test.clone(),
            attempt: index,
            cancel: self.cancel.clone(),
            captured: Arc::new(Mutex::new(Vec::new())),
        };
        let started = Instant::now();
        // The body is invoked inside the guard so a panic while building its
        // future is caught too.
        let body_context = context.clone();
        let attempt = AssertUnwindSafe(async move { body(body_context).await }).catch_unwind();

        let cancelled = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => true,
            result = attempt => {
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(failure)) => context.record_failure(failure),
                    Err(payload) => context.record_failure(TestFailure::from_panic(payload)),
                }
                false
            }
        };

        let failures = context.drain();
        let outcome = if cancelled {
            AttemptOutcome::Cancelled
        } else if failures.is_empty() {
            AttemptOutcome::Passed
        } else {
            AttemptOutcome::Failed
        };
        debug!("{} attempt {} finished: {:?}", test, index, outcome);

        TestExecutionAttempt {
            index,
            failures,
            outcome,
            elapsed: started.elapsed(),
        }
    }
}

fn final_disposition(attempt: &TestExecutionAttempt) -> Disposition {
    match attempt.outcome {
        AttemptOutcome::Passed => Disposition::Passed,
        AttemptOutcome::Cancelled if attempt.failures.is_empty() => Disposition::Skipped {
            reason: CANCELLED_REASON.to_string(),
        },
        AttemptOutcome::Failed | AttemptOutcome::Cancelled => Disposition::Failed {
            causes: attempt.failures.clone(),
        },
    }
}

fn retry_reason(index: u32, failure: &FailureRecord) -> String {
    format!(
        "retrying after transient failure on attempt {}/{}: {}",
        index, MAX_ATTEMPTS, failure
    )
}
