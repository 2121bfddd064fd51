use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info, warn};

/// Identity of a test case as the host reports it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TestId(String);

impl TestId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TestId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for TestId {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// One observed failure of a test attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRecord {
    pub test: TestId,
    /// Error type names, outermost first
    pub exception_types: Vec<String>,
    pub message: String,
}

impl FailureRecord {
    /// The outermost error type, which decides retry classification.
    pub fn primary_type(&self) -> Option<&str> {
        self.exception_types.first().map(String::as_str)
    }
}

impl fmt::Display for FailureRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.primary_type() {
            Some(kind) => write!(f, "{}: {}", kind, self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Final result of a test as the host sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Passed,
    Failed { causes: Vec<FailureRecord> },
    Skipped { reason: String },
}

impl Disposition {
    pub fn as_label(&self) -> &'static str {
        match self {
            Disposition::Passed => "passed",
            Disposition::Failed { .. } => "failed",
            Disposition::Skipped { .. } => "skipped",
        }
    }
}

/// Message delivered to the host's reporting system.
///
/// These are the only three kinds the host understands; retried attempts show
/// up as `Skipped` with a reason naming the retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportMessage {
    Passed { test: TestId, elapsed: Duration },
    Failed { test: TestId, causes: Vec<FailureRecord> },
    Skipped { test: TestId, reason: String },
}

impl ReportMessage {
    pub fn test(&self) -> &TestId {
        match self {
            ReportMessage::Passed { test, .. }
            | ReportMessage::Failed { test, .. }
            | ReportMessage::Skipped { test, .. } => test,
        }
    }

    pub(crate) fn from_disposition(test: TestId, disposition: &Disposition, elapsed: Duration) -> Self {
        match disposition {
            Disposition::Passed => ReportMessage::Passed { test, elapsed },
            Disposition::Failed { causes } => ReportMessage::Failed {
                test,
                causes: causes.clone(),
            },
            Disposition::Skipped { reason } => ReportMessage::Skipped {
                test,
                reason: reason.clone(),
            },
        }
    }
}

/// Receiver of test outcomes on the host side.
pub trait ReportSink: Send + Sync {
    fn report(&self, message: ReportMessage);
}

impl<S: ReportSink + ?Sized> ReportSink for Arc<S> {
    fn report(&self, message: ReportMessage) {
        (**self).report(message)
    }
}

impl<S: ReportSink + ?Sized> ReportSink for &S {
    fn report(&self, message: ReportMessage) {
        (**self).report(message)
    }
}

/// Keeps every reported message in memory.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    messages: Arc<Mutex<Vec<ReportMessage>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<ReportMessage> {
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl ReportSink for RecordingSink {
    fn report(&self, message: ReportMessage) {
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message);
    }
}

/// Writes outcomes to the tracing subscriber.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl ReportSink for TracingSink {
    fn report(&self, message: ReportMessage) {
        match message {
            ReportMessage::Passed { test, elapsed } => info!("PASS {} ({:?})", test, elapsed),
            ReportMessage::Failed { test, causes } => {
                error!("FAIL {}", test);
                for cause in causes {
                    error!("  caused by {}", cause);
                }
            }
            ReportMessage::Skipped { test, reason } => warn!("SKIP {}: {}", test, reason),
        }
    }
}
