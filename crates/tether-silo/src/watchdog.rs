//! Parent-death watch for hosted child processes.
//!
//! A hosted child must not outlive the process that spawned it. The child
//! arms the watch early in `main`; the returned token fires when the parent
//! is gone, giving the host runtime a chance to shut down cleanly (print
//! its goodbye, close the endpoint) instead of being reaped mid-frame.
//!
//! On Linux the check is `getppid()`: once the parent dies the child is
//! reparented and the value changes. Everywhere else (and as a second
//! opinion on Linux) a zero-signal `kill` probes whether the parent pid
//! still names a live process. `EPERM` counts as alive; only `ESRCH` means
//! gone.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[allow(unsafe_code)]
fn parent_alive(parent_pid: u32) -> bool {
    #[cfg(unix)]
    {
        // SAFETY: kill with signal 0 performs only the permission check.
        let rc = unsafe { libc::kill(parent_pid as libc::pid_t, 0) };
        if rc == 0 {
            return true;
        }
        let errno = std::io::Error::last_os_error().raw_os_error();
        if errno == Some(libc::EPERM) {
            return true;
        }
        #[cfg(target_os = "linux")]
        {
            // Belt and braces: reparenting is the authoritative signal.
            // SAFETY: getppid has no failure modes.
            let ppid = unsafe { libc::getppid() } as u32;
            if ppid == parent_pid {
                return true;
            }
        }
        false
    }
    #[cfg(not(unix))]
    {
        let _ = parent_pid;
        true
    }
}

/// Start watching the parent process.
///
/// Returns a token that is cancelled once the parent no longer exists. The
/// watch task polls at a cadence that keeps child shutdown comfortably
/// inside one second of parent death.
pub fn watch_parent(parent_pid: u32) -> CancellationToken {
    let token = CancellationToken::new();
    let signal = token.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        loop {
            ticker.tick().await;
            if !parent_alive(parent_pid) {
                info!(parent_pid, "parent process is gone, shutting down");
                signal.cancel();
                return;
            }
        }
    });
    token
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_process_is_alive() {
        assert!(parent_alive(std::process::id()));
    }

    #[cfg(unix)]
    #[test]
    fn dead_pid_is_not_alive() {
        // Spawn and reap a short-lived child; its pid then names nothing.
        let mut child = std::process::Command::new("true")
            .spawn()
            .expect("spawn /bin/true");
        let pid = child.id();
        child.wait().expect("reap child");
        assert!(!parent_alive(pid));
    }

    #[tokio::test]
    async fn watch_fires_for_a_dead_pid() {
        let mut child = std::process::Command::new("true")
            .spawn()
            .expect("spawn /bin/true");
        let pid = child.id();
        child.wait().expect("reap child");

        let token = watch_parent(pid);
        tokio::time::timeout(Duration::from_secs(2), token.cancelled())
            .await
            .expect("watch should fire quickly");
    }
}
