//! The default host executable.
//!
//! Spawned by a `ProcessSilo` with the parent pid as its sole argument.
//! Logs go to stderr; stdout belongs to the boot protocol.

use std::process::ExitCode;

use tracing_subscriber::EnvFilter;

use tether_silo::{run_host, HostConfig};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let parent_pid = match std::env::args().nth(1).map(|arg| arg.parse::<u32>()) {
        Some(Ok(pid)) => pid,
        _ => {
            eprintln!("usage: tether-host <parent-pid>");
            return ExitCode::FAILURE;
        }
    };

    match run_host(parent_pid, HostConfig::default()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("tether-host: {e}");
            ExitCode::FAILURE
        }
    }
}
