//! Heartbeat supervisor behavior under paused time.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tether_session::transport::memory_pair;
use tether_session::{
    DebuggerProbe, Endpoint, EndpointConfig, HeartbeatConfig, HeartbeatMonitor,
};

struct FakeDebugger {
    attached: AtomicBool,
}

impl FakeDebugger {
    fn new(attached: bool) -> Arc<Self> {
        Arc::new(Self {
            attached: AtomicBool::new(attached),
        })
    }
}

impl DebuggerProbe for FakeDebugger {
    fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }
}

fn config() -> HeartbeatConfig {
    HeartbeatConfig {
        interval: Duration::from_millis(100),
        skipped_threshold: 3,
        report_when_debugger_attached: false,
    }
}

fn connected_pair() -> (Endpoint, Endpoint) {
    let ((a_r, a_w), (b_r, b_w)) = memory_pair(64);
    let a = Endpoint::new(EndpointConfig::default().with_name("a"));
    let b = Endpoint::new(EndpointConfig::default().with_name("b"));
    a.attach(a_r, a_w, None).unwrap();
    b.attach(b_r, b_w, None).unwrap();
    (a, b)
}

#[tokio::test(start_paused = true)]
async fn healthy_peer_never_reports() {
    let (a, _b) = connected_pair();
    let reports = Arc::new(AtomicU64::new(0));
    let monitor = {
        let reports = Arc::clone(&reports);
        HeartbeatMonitor::start(
            a.downgrade(),
            config(),
            FakeDebugger::new(false),
            Arc::new(move |_| {
                reports.fetch_add(1, Ordering::SeqCst);
            }),
        )
    };

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(monitor.probes_sent() >= 10);
    assert!(monitor.probes_succeeded() >= 10);
    assert!(!monitor.has_reported());
    assert_eq!(reports.load(Ordering::SeqCst), 0);
    monitor.stop();
}

#[tokio::test(start_paused = true)]
async fn silent_peer_reports_once_after_the_window() {
    // The peer halves are held alive but never answer.
    let ((a_r, a_w), (_peer_r, _peer_w)) = memory_pair(64);
    let a = Endpoint::new(EndpointConfig::default());
    a.attach(a_r, a_w, None).unwrap();

    let reports = Arc::new(AtomicU64::new(0));
    let monitor = {
        let reports = Arc::clone(&reports);
        HeartbeatMonitor::start(
            a.downgrade(),
            config(),
            FakeDebugger::new(false),
            Arc::new(move |fault| {
                assert!(fault.consecutive_failures >= 2);
                assert!(fault.since_last_success >= Duration::from_millis(300));
                reports.fetch_add(1, Ordering::SeqCst);
            }),
        )
    };

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(monitor.has_reported());
    assert_eq!(reports.load(Ordering::SeqCst), 1, "exactly one report");
    assert!(monitor.probes_sent() > monitor.probes_succeeded());
    monitor.stop();
}

#[tokio::test(start_paused = true)]
async fn attached_debugger_suppresses_reporting() {
    let ((a_r, a_w), (_peer_r, _peer_w)) = memory_pair(64);
    let a = Endpoint::new(EndpointConfig::default());
    a.attach(a_r, a_w, None).unwrap();

    let reports = Arc::new(AtomicU64::new(0));
    let monitor = {
        let reports = Arc::clone(&reports);
        HeartbeatMonitor::start(
            a.downgrade(),
            config(),
            FakeDebugger::new(true),
            Arc::new(move |_| {
                reports.fetch_add(1, Ordering::SeqCst);
            }),
        )
    };

    tokio::time::sleep(Duration::from_secs(5)).await;
    // Probes issued and failed, but nothing was reported.
    assert!(monitor.probes_sent() >= 10);
    assert!(!monitor.has_reported());
    assert_eq!(reports.load(Ordering::SeqCst), 0);
    monitor.stop();
}

#[tokio::test(start_paused = true)]
async fn report_when_debugger_attached_overrides_suppression() {
    let ((a_r, a_w), (_peer_r, _peer_w)) = memory_pair(64);
    let a = Endpoint::new(EndpointConfig::default());
    a.attach(a_r, a_w, None).unwrap();

    let mut cfg = config();
    cfg.report_when_debugger_attached = true;
    let reports = Arc::new(AtomicU64::new(0));
    let monitor = {
        let reports = Arc::clone(&reports);
        HeartbeatMonitor::start(
            a.downgrade(),
            cfg,
            FakeDebugger::new(true),
            Arc::new(move |_| {
                reports.fetch_add(1, Ordering::SeqCst);
            }),
        )
    };

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(reports.load(Ordering::SeqCst), 1);
    monitor.stop();
}

#[tokio::test(start_paused = true)]
async fn dead_connection_reports_without_waiting_out_the_window() {
    let ((a_r, a_w), (peer_r, peer_w)) = memory_pair(64);
    let a = Endpoint::new(EndpointConfig::default());
    a.attach(a_r, a_w, None).unwrap();

    let reports = Arc::new(AtomicU64::new(0));
    let monitor = {
        let reports = Arc::clone(&reports);
        HeartbeatMonitor::start(
            a.downgrade(),
            config(),
            FakeDebugger::new(false),
            Arc::new(move |_| {
                reports.fetch_add(1, Ordering::SeqCst);
            }),
        )
    };

    // Kill the transport outright; the endpoint faults and the very next
    // probe observes a dead connection.
    drop(peer_r);
    drop(peer_w);
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert!(monitor.has_reported());
    assert_eq!(reports.load(Ordering::SeqCst), 1);
    monitor.stop();
}

#[tokio::test(start_paused = true)]
async fn stop_is_idempotent_and_final() {
    let ((a_r, a_w), (_peer_r, _peer_w)) = memory_pair(64);
    let a = Endpoint::new(EndpointConfig::default());
    a.attach(a_r, a_w, None).unwrap();

    let reports = Arc::new(AtomicU64::new(0));
    let monitor = {
        let reports = Arc::clone(&reports);
        HeartbeatMonitor::start(
            a.downgrade(),
            config(),
            FakeDebugger::new(false),
            Arc::new(move |_| {
                reports.fetch_add(1, Ordering::SeqCst);
            }),
        )
    };

    monitor.stop();
    monitor.stop();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(!monitor.has_reported());
    assert_eq!(reports.load(Ordering::SeqCst), 0);
}
