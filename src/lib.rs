//! Test fixtures for exercising a NATS client against a real server.
//!
//! - [`ProcessSupervisor`] starts an ephemeral server on a port, verifies it
//!   accepts client connections, bounces it, drains it and tears it down.
//! - [`RetryableTestRunner`] re-runs a test whose only failures were
//!   transient (no server reachable) and reports one final outcome.
//! - [`ActorBarrier`] lets a test wait for callbacks that fire on other threads.

pub mod barrier;
pub mod cleanup;
pub mod cli;
pub mod error;
pub mod ports;
pub mod probe;
pub mod report;
pub mod retry_policy;
pub mod server_args;
pub mod signals;
pub mod supervisor;
pub mod test_runner;

pub use barrier::{ActorBarrier, BarrierConfig};
pub use cleanup::{global_cleanup, CleanupReport};
pub use error::{BarrierError, NoServersAvailable, ProcessShutdownError, SupervisorError};
pub use probe::{NatsProbe, ProbeFault, ProbeTarget, ReadinessProbe};
pub use report::{Disposition, FailureRecord, ReportMessage, ReportSink, TestId};
pub use retry_policy::{RetryPolicy, MAX_ATTEMPTS};
pub use server_args::ServerArgs;
pub use supervisor::{ProcessState, ProcessSupervisor, ServerProcessHandle, SupervisorConfig};
pub use test_runner::{AttemptContext, ExecutionSummary, RetryableTestRunner, TestFailure};

type Result<T> = color_eyre::eyre::Result<T>;
