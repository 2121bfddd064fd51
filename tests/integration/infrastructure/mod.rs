pub mod server_harness;

pub use server_harness::{
    delayed_start, fast_config, free_port, init_tracing, is_process_alive, stub_binary, wait_until_serving,
    ServerHarness,
};
