//! Periodic supervision of tracked tunnel processes.
//!
//! One cycle sweeps the registry (kill expired, reap exited, collect crash
//! restarts), performs the restarts through the launcher with each tunnel's
//! remaining lease, and publishes a single aggregate status report on the
//! control topic. Per-entry failures degrade the report but never abort a
//! cycle, and a cycle failing to publish never stops the next one.

use std::time::Duration;

use serde_json::json;
use tracing::warn;

use crate::launcher;
use crate::lease::unix_now;
use crate::registry::Registry;
use crate::shadow::{Channel, Topics};

/// Run one supervision cycle and publish the aggregate report.
pub async fn run_cycle<C: Channel>(registry: &Registry, channel: &C, topics: &Topics) {
    let outcome = registry.sweep(unix_now()).await;

    for restart in outcome.restarts {
        if let Err(e) = launcher::start_tunnel(
            registry,
            channel,
            &topics.control,
            &restart.command,
            restart.remaining_minutes,
            &restart.access_token,
        )
        .await
        {
            warn!("tunnel restart failed: {e}");
        }
    }

    let report = json!({ "state": { "reported": { "tunnels": outcome.reports } } });
    if let Err(e) = channel.publish_json(&topics.control, &report).await {
        warn!("failed to publish tunnel status report: {e}");
    }
}

/// Supervision loop: one [`run_cycle`] immediately, then one per interval,
/// forever. The caller selects this against the shutdown signal.
pub async fn run<C: Channel>(registry: Registry, channel: C, topics: Topics, interval_secs: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
    loop {
        interval.tick().await;
        run_cycle(&registry, &channel, &topics).await;
    }
}
