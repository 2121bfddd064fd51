use crate::error::NoServersAvailable;
use crate::report::FailureRecord;
use std::any::type_name;
use std::collections::BTreeSet;

/// Attempts a test gets before a transient failure counts as final.
pub const MAX_ATTEMPTS: u32 = 2;

/// Error types whose failures are considered transient.
///
/// An attempt is retried only when *every* one of its failures is transient.
/// A single failure of any other type makes the whole attempt final, even if
/// the rest of its failures were transient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    transient: BTreeSet<String>,
}

impl RetryPolicy {
    /// Policy built from explicit type names.
    pub fn new<I, S>(type_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            transient: type_names.into_iter().map(Into::into).collect(),
        }
    }

    /// Policy that never retries.
    pub fn none() -> Self {
        Self::new(Vec::<String>::new())
    }

    /// Policy treating only errors of type `E` as transient.
    pub fn transient<E: 'static>() -> Self {
        Self::new([type_name::<E>()])
    }

    /// Returns a copy that also treats `E` as transient.
    pub fn and<E: 'static>(mut self) -> Self {
        self.transient.insert(type_name::<E>().to_string());
        self
    }

    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.transient.iter().map(String::as_str)
    }

    /// Classifies one failure by its outermost error type.
    pub fn is_transient(&self, failure: &FailureRecord) -> bool {
        failure
            .primary_type()
            .map(|kind| self.transient.contains(kind))
            .unwrap_or(false)
    }

    /// True if the attempt failed and every failure is transient.
    pub fn allows_retry(&self, failures: &[FailureRecord]) -> bool {
        !failures.is_empty() && failures.iter().all(|f| self.is_transient(f))
    }
}

impl Default for RetryPolicy {
    /// Only "no servers reachable" is transient.
    fn default() -> Self {
        Self::transient::<NoServersAvailable>()
    }
}
