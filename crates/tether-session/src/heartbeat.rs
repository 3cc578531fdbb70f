//! The heartbeat supervisor.
//!
//! Probes the peer on a fixed interval and raises the failure callback at
//! most once per supervisor lifetime. A probe that comes back with a lost
//! connection reports immediately; timeouts report once the configured
//! window (`interval x skipped_threshold`) has elapsed without a success.
//!
//! A debugger pausing the peer is indistinguishable from a crash on the
//! wire, so the supervisor consults an injected [`DebuggerProbe`] and, by
//! default, suppresses reporting while one is attached. Probes still issue
//! and counters still advance under suppression.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::endpoint::WeakEndpoint;
use crate::errors::CallError;

/// Heartbeat tunables.
#[derive(Clone, Debug)]
pub struct HeartbeatConfig {
    /// Probe cadence.
    pub interval: Duration,
    /// How many intervals may pass without a success before a timeout is a
    /// failure.
    pub skipped_threshold: u32,
    /// Report failures even while a debugger is attached.
    pub report_when_debugger_attached: bool,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            skipped_threshold: 10,
            report_when_debugger_attached: false,
        }
    }
}

impl HeartbeatConfig {
    /// The window after which missing replies count as a failure.
    pub fn failure_window(&self) -> Duration {
        self.interval * self.skipped_threshold
    }
}

/// Oracle for "is a debugger currently attached to this process".
pub trait DebuggerProbe: Send + Sync + 'static {
    /// Whether a debugger is attached right now.
    fn is_attached(&self) -> bool;
}

/// Production probe: assumes no debugger.
pub struct NoDebugger;

impl DebuggerProbe for NoDebugger {
    fn is_attached(&self) -> bool {
        false
    }
}

/// What the supervisor observed when it gave up on the peer.
#[derive(Debug, Clone)]
pub struct HeartbeatFault {
    /// Time since the last successful probe.
    pub since_last_success: Duration,
    /// Probes that failed in a row.
    pub consecutive_failures: u32,
}

/// Invoked at most once per supervisor lifetime.
pub type HeartbeatCallback = Arc<dyn Fn(HeartbeatFault) + Send + Sync>;

struct MonitorShared {
    cancel: CancellationToken,
    reported: AtomicBool,
    probes_sent: AtomicU64,
    probes_succeeded: AtomicU64,
}

/// Supervises liveness of one endpoint's peer.
///
/// Probing starts at construction and stops on [`stop`](Self::stop) or
/// drop; both are idempotent, and a probe in flight at stop time completes
/// without raising.
pub struct HeartbeatMonitor {
    shared: Arc<MonitorShared>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl HeartbeatMonitor {
    /// Start probing `endpoint` with the given configuration.
    pub fn start(
        endpoint: WeakEndpoint,
        config: HeartbeatConfig,
        debugger: Arc<dyn DebuggerProbe>,
        on_failure: HeartbeatCallback,
    ) -> Self {
        let shared = Arc::new(MonitorShared {
            cancel: CancellationToken::new(),
            reported: AtomicBool::new(false),
            probes_sent: AtomicU64::new(0),
            probes_succeeded: AtomicU64::new(0),
        });
        let task = tokio::spawn(run(
            endpoint,
            config,
            debugger,
            on_failure,
            Arc::clone(&shared),
        ));
        Self {
            shared,
            task: parking_lot::Mutex::new(Some(task)),
        }
    }

    /// Probes issued so far.
    pub fn probes_sent(&self) -> u64 {
        self.shared.probes_sent.load(Ordering::Relaxed)
    }

    /// Probes that came back in time.
    pub fn probes_succeeded(&self) -> u64 {
        self.shared.probes_succeeded.load(Ordering::Relaxed)
    }

    /// Whether the failure callback has fired.
    pub fn has_reported(&self) -> bool {
        self.shared.reported.load(Ordering::Relaxed)
    }

    /// Halt probing. Idempotent; outstanding probes complete but never
    /// raise.
    pub fn stop(&self) {
        self.shared.cancel.cancel();
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run(
    endpoint: WeakEndpoint,
    config: HeartbeatConfig,
    debugger: Arc<dyn DebuggerProbe>,
    on_failure: HeartbeatCallback,
    shared: Arc<MonitorShared>,
) {
    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it so probing starts one
    // interval in.
    ticker.tick().await;

    let mut last_success = Instant::now();
    let mut consecutive_failures = 0u32;

    loop {
        tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        shared.probes_sent.fetch_add(1, Ordering::Relaxed);
        let outcome = match endpoint.upgrade() {
            None => Err(CallError::NotConnected),
            Some(endpoint) => endpoint.ping_timeout(config.interval).await,
        };

        match outcome {
            Ok(()) => {
                shared.probes_succeeded.fetch_add(1, Ordering::Relaxed);
                last_success = Instant::now();
                consecutive_failures = 0;
            }
            Err(CallError::TimedOut) => {
                consecutive_failures += 1;
                debug!(consecutive_failures, "heartbeat probe timed out");
                if last_success.elapsed() >= config.failure_window() {
                    report(
                        &shared,
                        &config,
                        &debugger,
                        &on_failure,
                        last_success,
                        consecutive_failures,
                    );
                }
            }
            Err(e) => {
                // The connection is objectively gone (or refused the
                // probe); no point waiting out the window.
                consecutive_failures += 1;
                warn!(error = %e, "heartbeat probe failed");
                report(
                    &shared,
                    &config,
                    &debugger,
                    &on_failure,
                    last_success,
                    consecutive_failures,
                );
            }
        }
    }
}

fn report(
    shared: &MonitorShared,
    config: &HeartbeatConfig,
    debugger: &Arc<dyn DebuggerProbe>,
    on_failure: &HeartbeatCallback,
    last_success: Instant,
    consecutive_failures: u32,
) {
    if shared.cancel.is_cancelled() {
        return;
    }
    if !config.report_when_debugger_attached && debugger.is_attached() {
        debug!("heartbeat failure suppressed: debugger attached");
        return;
    }
    if shared.reported.swap(true, Ordering::SeqCst) {
        return;
    }
    let fault = HeartbeatFault {
        since_last_success: last_success.elapsed(),
        consecutive_failures,
    };
    info!(
        since_last_success = ?fault.since_last_success,
        consecutive_failures,
        "reporting heartbeat failure"
    );
    on_failure(fault);
}
