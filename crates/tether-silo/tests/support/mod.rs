//! Shared helpers for cross-process silo tests.

use std::path::PathBuf;

/// Locate the prebuilt `tether-host` binary next to the test executable.
///
/// Test binaries live in `target/<profile>/deps/`; crate binaries one or
/// two levels up. Walk upwards a few levels and take the first hit.
pub fn find_host_binary() -> PathBuf {
    let current_exe = std::env::current_exe().expect("test executable path");
    let mut dir = current_exe.parent();
    for _ in 0..3 {
        let Some(candidate_dir) = dir else { break };
        let candidate = candidate_dir.join("tether-host");
        if candidate.exists() {
            return candidate;
        }
        dir = candidate_dir.parent();
    }
    panic!(
        "tether-host binary not found near {}; build it with `cargo build -p tether-silo --bin tether-host`",
        current_exe.display()
    );
}
