//! Registry of supervised tunnel-proxy processes.
//!
//! [`Registry`] is the single authority for tracked tunnel processes. Entries
//! are created by the launcher at spawn time and removed exactly once, by
//! [`Registry::sweep`] when a process is observed to have exited (naturally or
//! after a supervisory kill) or by [`Registry::kill_all`] at shutdown. Entries
//! are never mutated in place — a restart creates a fresh entry under the new
//! pid.
//!
//! ## Concurrency
//!
//! The map lives behind one async `Mutex`. Every read-modify-write sequence
//! (check-expiry-then-kill, check-alive-then-remove) happens under a single
//! lock acquisition, so a notification-triggered spawn and a supervision-
//! triggered reap can never race on the same entry.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::process::Child;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// One supervised proxy invocation. Immutable once inserted.
pub struct TunnelProcess {
    /// OS process id, the registry key.
    pub pid: u32,
    /// Owned child handle. The registry holds it from spawn until reap.
    pub child: Child,
    /// Absolute lease boundary, epoch seconds.
    pub expire_at: i64,
    /// Exact argument vector used to spawn, retained for identical respawn.
    pub command: Vec<String>,
    /// Access token the proxy was started with, retained for respawn. Secret.
    pub access_token: String,
}

/// One line of a supervision cycle's aggregate report.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TunnelReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_minutes: Option<f64>,
    pub status: String,
}

impl TunnelReport {
    fn entry(pid: u32, remaining_minutes: f64, status: &str) -> Self {
        Self {
            pid: Some(pid),
            remaining_minutes: Some(remaining_minutes),
            status: status.to_string(),
        }
    }

    fn degraded() -> Self {
        Self {
            pid: None,
            remaining_minutes: None,
            status: "error getting tunnel processes".to_string(),
        }
    }
}

/// A crashed-but-unexpired tunnel that should be relaunched with its remaining
/// lease.
pub struct RestartRequest {
    pub command: Vec<String>,
    pub remaining_minutes: f64,
    pub access_token: String,
}

/// Outcome of one supervision pass over the registry.
pub struct SweepOutcome {
    /// Per-entry classification lines for the aggregate report.
    pub reports: Vec<TunnelReport>,
    /// Relaunches to perform after the pass.
    pub restarts: Vec<RestartRequest>,
}

/// Shared table of supervised tunnel processes.
///
/// Clone-able — all clones share the same inner map.
#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<Mutex<HashMap<u32, TunnelProcess>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a freshly spawned process. Only the launcher calls this.
    pub async fn insert(&self, process: TunnelProcess) {
        self.inner.lock().await.insert(process.pid, process);
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }

    /// Pids currently tracked, in no particular order.
    pub async fn pids(&self) -> Vec<u32> {
        self.inner.lock().await.keys().copied().collect()
    }

    /// One supervision pass: classify every entry, kill expired-but-alive
    /// processes, reap exited ones, and collect crash restarts.
    ///
    /// Entries are independent; a failure inspecting one is logged, folded into
    /// the report as a degraded line, and never aborts the rest of the pass.
    /// Restarts are returned rather than performed here so the relaunch (which
    /// re-enters the registry through the launcher) happens outside this lock.
    #[allow(clippy::cast_precision_loss)]
    pub async fn sweep(&self, now: i64) -> SweepOutcome {
        let mut reports = Vec::new();
        let mut restarts = Vec::new();

        let mut processes = self.inner.lock().await;
        if processes.is_empty() {
            info!("no tunnel processes running");
            return SweepOutcome { reports, restarts };
        }

        let pids: Vec<u32> = processes.keys().copied().collect();
        for pid in pids {
            let Some(process) = processes.get_mut(&pid) else {
                continue;
            };
            let remaining_minutes = (process.expire_at - now) as f64 / 60.0;

            match process.child.try_wait() {
                // Still alive.
                Ok(None) => {
                    if remaining_minutes < 1.0 {
                        info!(
                            "tunnel expired, will be killed: pid: {pid} now: {now} expire_at: {}",
                            process.expire_at
                        );
                        if let Err(e) = process.child.start_kill() {
                            warn!("failed to kill expired tunnel pid {pid}: {e}");
                            reports.push(TunnelReport::degraded());
                        } else {
                            // Reaped on the next cycle once the exit is visible.
                            reports.push(TunnelReport::entry(
                                pid,
                                remaining_minutes,
                                "to be killed",
                            ));
                        }
                    } else {
                        info!(
                            "tunnel still running: pid: {pid} remaining minutes: {remaining_minutes:.2}"
                        );
                        reports.push(TunnelReport::entry(pid, remaining_minutes, "running"));
                    }
                }
                // Exited — reap exactly once, restarting first if it crashed
                // before its lease ended.
                Ok(Some(status)) => {
                    if remaining_minutes > 1.0 {
                        warn!(
                            "no tunnel process with pid {pid} but remaining time is positive, try to restart tunnel"
                        );
                        restarts.push(RestartRequest {
                            command: process.command.clone(),
                            remaining_minutes,
                            access_token: process.access_token.clone(),
                        });
                        reports.push(TunnelReport::entry(
                            pid,
                            remaining_minutes,
                            "crashed restarting",
                        ));
                    }
                    info!("tunnel exited: pid: {pid} status: {status}");
                    reports.push(TunnelReport::entry(pid, remaining_minutes, "exited"));
                    processes.remove(&pid);
                }
                Err(e) => {
                    warn!("error checking tunnel process {pid}: {e}");
                    reports.push(TunnelReport::degraded());
                }
            }
        }

        SweepOutcome { reports, restarts }
    }

    /// Best-effort SIGKILL of every tracked process, then reap them all.
    /// Shutdown path only; no graceful drain is attempted.
    pub async fn kill_all(&self) {
        let mut processes = self.inner.lock().await;
        if processes.is_empty() {
            return;
        }
        info!("killing tunnel processes...");
        for (pid, process) in processes.iter_mut() {
            info!("killing process with pid: {pid}");
            if let Err(e) = process.child.start_kill() {
                warn!("failed to kill pid {pid}: {e}");
            }
        }
        for process in processes.values_mut() {
            let _ = process.child.wait().await;
        }
        processes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::unix_now;
    use std::process::Stdio;
    use std::time::Duration;
    use tokio::process::Command;

    fn spawn(program: &str, args: &[&str]) -> Child {
        Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .expect("spawn test child")
    }

    async fn track(registry: &Registry, child: Child, expire_at: i64) -> u32 {
        let pid = child.id().expect("child pid");
        registry
            .insert(TunnelProcess {
                pid,
                child,
                expire_at,
                command: vec!["/bin/sleep".to_string(), "300".to_string()],
                access_token: String::new(),
            })
            .await;
        pid
    }

    #[tokio::test]
    async fn test_sweep_empty_registry() {
        let registry = Registry::new();
        let outcome = registry.sweep(unix_now()).await;
        assert!(outcome.reports.is_empty());
        assert!(outcome.restarts.is_empty());
    }

    #[tokio::test]
    async fn test_running_entry_is_untouched() {
        let registry = Registry::new();
        let now = unix_now();
        let pid = track(&registry, spawn("sleep", &["300"]), now + 600).await;

        let outcome = registry.sweep(now).await;
        assert_eq!(outcome.reports.len(), 1);
        assert_eq!(outcome.reports[0].status, "running");
        assert_eq!(outcome.reports[0].pid, Some(pid));
        assert_eq!(registry.len().await, 1);
        assert!(outcome.restarts.is_empty());

        registry.kill_all().await;
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_expired_alive_is_killed_then_reaped() {
        let registry = Registry::new();
        let now = unix_now();
        let pid = track(&registry, spawn("sleep", &["300"]), now - 5).await;

        // Cycle 1: kill signal sent, entry retained for reap next cycle.
        let outcome = registry.sweep(now).await;
        assert_eq!(outcome.reports.len(), 1);
        assert_eq!(outcome.reports[0].status, "to be killed");
        assert_eq!(registry.len().await, 1);

        // Give the kill a moment to land.
        tokio::time::sleep(Duration::from_millis(300)).await;

        // Cycle 2: exited with remaining < 1 minute — removed, no restart.
        let outcome = registry.sweep(unix_now()).await;
        assert_eq!(outcome.reports.len(), 1);
        assert_eq!(outcome.reports[0].status, "exited");
        assert_eq!(outcome.reports[0].pid, Some(pid));
        assert!(outcome.restarts.is_empty());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_crashed_entry_requests_restart_and_is_removed() {
        let registry = Registry::new();
        let now = unix_now();
        // Exits immediately, lease still has ~10 minutes: a crash.
        track(&registry, spawn("true", &[]), now + 600).await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        let outcome = registry.sweep(unix_now()).await;
        assert_eq!(outcome.restarts.len(), 1);
        let restart = &outcome.restarts[0];
        assert_eq!(restart.command, vec!["/bin/sleep", "300"]);
        assert!(restart.remaining_minutes > 9.0 && restart.remaining_minutes <= 10.0);
        // Both the crash classification and the reap line are reported.
        let statuses: Vec<&str> = outcome.reports.iter().map(|r| r.status.as_str()).collect();
        assert_eq!(statuses, vec!["crashed restarting", "exited"]);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_exited_within_final_minute_is_reaped_without_restart() {
        let registry = Registry::new();
        let now = unix_now();
        track(&registry, spawn("true", &[]), now + 30).await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        let outcome = registry.sweep(unix_now()).await;
        assert_eq!(outcome.reports.len(), 1);
        assert_eq!(outcome.reports[0].status, "exited");
        assert!(outcome.restarts.is_empty());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_kill_all_leaves_no_children() {
        let registry = Registry::new();
        let now = unix_now();
        track(&registry, spawn("sleep", &["300"]), now + 600).await;
        track(&registry, spawn("sleep", &["300"]), now + 600).await;
        assert_eq!(registry.len().await, 2);

        registry.kill_all().await;
        assert!(registry.is_empty().await);
    }

    #[test]
    fn test_report_serialization_omits_missing_fields() {
        let degraded = TunnelReport::degraded();
        let json = serde_json::to_value(&degraded).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "status": "error getting tunnel processes" })
        );

        let entry = TunnelReport::entry(42, 9.5, "running");
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["pid"], 42);
        assert_eq!(json["status"], "running");
    }
}
