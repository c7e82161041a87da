use std::env;
use std::process;

use node_core::bootstrap;
use node_core::config::RuntimeConfig;

fn init_tracing() {
    // RUST_LOG wins, then NODE_CORE_LOG, then warnings only.
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_from_env("NODE_CORE_LOG"))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() {
    init_tracing();

    let args: Vec<String> = env::args().collect();
    let config = RuntimeConfig::from_env();
    let status = bootstrap::start(config, args);
    process::exit(status);
}
