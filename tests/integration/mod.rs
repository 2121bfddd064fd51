//! Integration tests for the natsfix fixtures
//!
//! Servers are played by the `stub-server` binary built with the crate.

pub mod infrastructure;
pub mod scenarios;

pub use infrastructure::ServerHarness;
