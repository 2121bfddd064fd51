mod barrier_tests;
mod cleanup_tests;
mod retry_runner_tests;
