//! Tunnel launcher — spawns the external proxy and tracks it under a lease.
//!
//! The proxy is an opaque foreground executable. It is spawned by argument
//! vector (never through a shell — endpoint and region strings come from the
//! state store and must not be interpolated), receives its access token through
//! the [`ACCESS_TOKEN_ENV`] environment variable scoped to that one child, and
//! has its combined output piped into drain tasks that log each line for
//! diagnostics. Nothing is parsed from that output.

use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::lease::{expire_at, unix_now};
use crate::registry::{Registry, TunnelProcess};
use crate::shadow::{status_payload, Channel, StatusKind};

/// Environment variable the proxy executable reads its access token from.
pub const ACCESS_TOKEN_ENV: &str = "AWSIOT_TUNNEL_ACCESS_TOKEN";

/// Failure to launch the proxy executable.
#[derive(Debug)]
pub enum SpawnError {
    /// Empty command vector — nothing to execute.
    EmptyCommand,
    /// The OS refused the spawn (missing binary, permissions, resources).
    Spawn(String),
    /// The process exited before it could be tracked.
    Untracked,
}

impl std::fmt::Display for SpawnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpawnError::EmptyCommand => write!(f, "empty tunnel command"),
            SpawnError::Spawn(e) => write!(f, "failed to spawn tunnel proxy: {e}"),
            SpawnError::Untracked => write!(f, "tunnel proxy exited before it could be tracked"),
        }
    }
}

/// Spawn the proxy with the given argument vector and lease, insert it into
/// the registry, and publish a SUCCESS status with the expiry time.
///
/// On failure an ERROR status is published and the error returned; there is no
/// automatic retry — a re-delivered directive or the supervision loop's crash
/// handling drives any retry.
pub async fn start_tunnel<C: Channel>(
    registry: &Registry,
    channel: &C,
    control_topic: &str,
    command: &[String],
    lifetime_minutes: f64,
    access_token: &str,
) -> Result<u32, SpawnError> {
    let Some((program, args)) = command.split_first() else {
        return Err(SpawnError::EmptyCommand);
    };
    info!("trying to start tunnel proxy with command: {}", command.join(" "));

    let mut cmd = Command::new(program);
    cmd.args(args)
        .env(ACCESS_TOKEN_ENV, access_token)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            let message = format!("failed to start secured tunnel: {e}");
            warn!("{message}");
            report(channel, control_topic, StatusKind::Error, &message).await;
            return Err(SpawnError::Spawn(e.to_string()));
        }
    };

    let Some(pid) = child.id() else {
        report(
            channel,
            control_topic,
            StatusKind::Error,
            "tunnel proxy exited before it could be tracked",
        )
        .await;
        return Err(SpawnError::Untracked);
    };
    info!("tunnel proxy started with pid {pid}");

    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(drain_output(pid, "stdout", stdout));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(drain_output(pid, "stderr", stderr));
    }

    let now = unix_now();
    let tunnel_expire_at = expire_at(now, lifetime_minutes);
    info!("tunnel_expire_at: {tunnel_expire_at} now: {now}");

    registry
        .insert(TunnelProcess {
            pid,
            child,
            expire_at: tunnel_expire_at,
            command: command.to_vec(),
            access_token: access_token.to_string(),
        })
        .await;

    let message = format!("tunnel started, expires at {}", format_utc(tunnel_expire_at));
    info!("{message}");
    report(channel, control_topic, StatusKind::Success, &message).await;

    Ok(pid)
}

/// Publish a status message; steady-state telemetry is fire-and-forget, so a
/// publish failure is only logged.
async fn report<C: Channel>(channel: &C, topic: &str, kind: StatusKind, message: &str) {
    if let Err(e) = channel.publish_json(topic, &status_payload(kind, message)).await {
        warn!("status publish failed: {e}");
    }
}

fn format_utc(epoch_secs: i64) -> String {
    chrono::DateTime::from_timestamp(epoch_secs, 0)
        .map_or_else(|| epoch_secs.to_string(), |t| {
            t.format("%Y-%m-%d %H:%M:%S UTC").to_string()
        })
}

/// Log each line the proxy writes. Diagnostics only; pipes are drained so the
/// child never blocks on a full pipe.
async fn drain_output(pid: u32, stream: &'static str, reader: impl tokio::io::AsyncRead + Unpin) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("tunnel[{pid}] {stream}: {line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shadow::MockChannel;

    const CONTROL: &str = "cmd/sectunnel/test-device/resp";

    #[tokio::test]
    async fn test_start_tunnel_tracks_process_and_reports_success() {
        let registry = Registry::new();
        let channel = MockChannel::new();
        let command = vec!["sleep".to_string(), "300".to_string()];

        let before = unix_now();
        let pid = start_tunnel(&registry, &channel, CONTROL, &command, 58.0, "AT1")
            .await
            .unwrap();

        assert_eq!(registry.pids().await, vec![pid]);

        let published = channel.published_json().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, CONTROL);
        assert_eq!(published[0].1["status"], "SUCCESS");
        let message = published[0].1["message"].as_str().unwrap();
        assert!(message.starts_with("tunnel started, expires at "));
        assert!(!message.contains("AT1"));

        // expire_at ~ now + 58 minutes.
        let outcome = registry.sweep(before).await;
        assert_eq!(outcome.reports.len(), 1);
        let remaining = outcome.reports[0].remaining_minutes.unwrap();
        assert!(remaining > 57.5 && remaining <= 58.5);

        registry.kill_all().await;
    }

    #[tokio::test]
    async fn test_spawn_failure_reports_error_and_leaves_registry_untouched() {
        let registry = Registry::new();
        let channel = MockChannel::new();
        let command = vec!["/nonexistent/localproxy".to_string()];

        let err = start_tunnel(&registry, &channel, CONTROL, &command, 10.0, "AT1")
            .await
            .unwrap_err();
        assert!(matches!(err, SpawnError::Spawn(_)));
        assert!(registry.is_empty().await);

        let published = channel.published_json().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].1["status"], "ERROR");
        assert!(published[0].1["message"]
            .as_str()
            .unwrap()
            .starts_with("failed to start secured tunnel"));
    }

    #[tokio::test]
    async fn test_empty_command_is_rejected() {
        let registry = Registry::new();
        let channel = MockChannel::new();
        let err = start_tunnel(&registry, &channel, CONTROL, &[], 10.0, "AT1")
            .await
            .unwrap_err();
        assert!(matches!(err, SpawnError::EmptyCommand));
        assert!(channel.published().await.is_empty());
    }

    #[test]
    fn test_format_utc() {
        // 2023-11-14 22:13:20 UTC
        assert_eq!(format_utc(1_700_000_000), "2023-11-14 22:13:20 UTC");
    }
}
