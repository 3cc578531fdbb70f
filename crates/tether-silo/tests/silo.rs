//! Cross-process silo tests against the real `tether-host` binary, plus
//! scripted fake hosts for the failure paths.

mod support;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use tether_session::{EndpointState, HeartbeatConfig};
use tether_silo::{ProcessSilo, SiloConfig, SiloError, SiloFaultReason};

fn host_config() -> SiloConfig {
    SiloConfig::new(support::find_host_binary())
}

/// A fake host driven by a shell one-liner instead of the real binary.
fn scripted_host(script: &str) -> SiloConfig {
    let mut config = SiloConfig::new("/bin/sh");
    config.host_args = vec!["-c".to_owned(), script.to_owned(), "fake-host".to_owned()];
    config.ready_timeout = Duration::from_millis(500);
    config
}

#[tokio::test]
async fn start_ping_stop_round_trip() {
    let silo = ProcessSilo::start(host_config()).await.unwrap();

    assert!(silo.is_process_running());
    assert!(!silo.has_process_failed());
    assert_eq!(silo.endpoint().state(), EndpointState::Connected);
    assert_eq!(silo.endpoint().peer_name().as_deref(), Some("tether-host"));

    silo.endpoint().ping().await.unwrap();

    silo.stop().await;
    assert!(!silo.is_process_running());
    assert!(!silo.has_process_failed());
}

#[tokio::test]
async fn child_that_never_says_ready_times_out() {
    let err = ProcessSilo::start(scripted_host("echo booting; sleep 30"))
        .await
        .unwrap_err();
    assert!(matches!(err, SiloError::HandshakeTimeout));
    assert!(err.is_handshake_failure());
}

#[tokio::test]
async fn log_line_in_the_handshake_window_is_rejected() {
    let err = ProcessSilo::start(scripted_host(
        "echo booting; echo starting listener; echo 40123; echo ready; sleep 30",
    ))
    .await
    .unwrap_err();
    match err {
        SiloError::Handshake(e) => {
            assert!(e.to_string().contains("invalid port"), "got: {e}");
        }
        other => panic!("expected handshake rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn child_that_exits_immediately_fails_the_handshake() {
    let err = ProcessSilo::start(scripted_host("exit 0")).await.unwrap_err();
    assert!(matches!(err, SiloError::Handshake(_)));
}

#[cfg(unix)]
#[tokio::test]
async fn killed_child_is_detected_and_cleaned_up() {
    let mut config = host_config();
    config.heartbeat = HeartbeatConfig {
        interval: Duration::from_millis(100),
        skipped_threshold: 5,
        report_when_debugger_attached: false,
    };
    let silo = ProcessSilo::start(config).await.unwrap();

    let detected = Arc::new(AtomicU64::new(0));
    let handled = Arc::new(AtomicU64::new(0));
    let reason_seen = Arc::new(Mutex::new(None));
    {
        let detected = Arc::clone(&detected);
        let reason_seen = Arc::clone(&reason_seen);
        silo.on_fault_detected(Arc::new(move |reason| {
            detected.fetch_add(1, Ordering::SeqCst);
            *reason_seen.lock() = Some(reason);
        }));
    }
    {
        let handled = Arc::clone(&handled);
        silo.on_fault_handled(Arc::new(move |_, _| {
            handled.fetch_add(1, Ordering::SeqCst);
        }));
    }

    // Hard-kill the child out from under the silo.
    let pid = silo.child_pid().expect("child is running") as libc::pid_t;
    #[allow(unsafe_code)]
    // SAFETY: pid names our own child; SIGKILL is the point of the test.
    unsafe {
        libc::kill(pid, libc::SIGKILL);
    }

    // Detection comes from the read pump (EOF) or the heartbeat,
    // whichever notices first; both classify as a failure.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while detected.load(Ordering::SeqCst) == 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    assert_eq!(detected.load(Ordering::SeqCst), 1, "fault detected exactly once");
    assert!(silo.has_process_failed());
    assert!(matches!(
        *reason_seen.lock(),
        Some(SiloFaultReason::ConnectionFailure) | Some(SiloFaultReason::HeartbeatFailure)
    ));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while handled.load(Ordering::SeqCst) == 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(handled.load(Ordering::SeqCst), 1, "fault handled exactly once");
    assert!(!silo.is_process_running());
}

#[cfg(unix)]
#[tokio::test]
async fn host_with_a_dead_parent_exits_cleanly() {
    use std::process::Stdio;
    use tokio::io::{AsyncBufReadExt, BufReader};

    // Spawn and reap a throwaway process; its pid then names nothing, so
    // the host should boot, notice its "parent" is gone, and leave.
    let mut throwaway = std::process::Command::new("true").spawn().unwrap();
    let dead_pid = throwaway.id();
    throwaway.wait().unwrap();

    let mut child = tokio::process::Command::new(support::find_host_binary())
        .arg(dead_pid.to_string())
        .stdout(Stdio::piped())
        .spawn()
        .unwrap();

    let stdout = child.stdout.take().unwrap();
    let mut lines = BufReader::new(stdout).lines();
    let mut seen = Vec::new();
    while let Ok(Ok(Some(line))) =
        tokio::time::timeout(Duration::from_secs(5), lines.next_line()).await
    {
        seen.push(line);
    }

    let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
        .await
        .expect("host exits promptly")
        .unwrap();
    assert!(status.success(), "clean exit, got {status:?}");

    assert_eq!(seen.first().map(String::as_str), Some("booting"));
    assert_eq!(seen.last().map(String::as_str), Some("goodbye"));
    // booting, port, ready, goodbye.
    assert_eq!(seen.len(), 4);
    assert!(seen[1].parse::<u16>().is_ok(), "port line: {:?}", seen[1]);
    assert_eq!(seen[2], "ready");
}
