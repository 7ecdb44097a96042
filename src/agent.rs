//! Device-side agent lifecycle.
//!
//! Startup: verify the proxy executable, connect to the state store (fatal on
//! failure), report `"ready"`, start the notification dispatcher, issue one
//! shadow GET (with a logged timeout if no response arrives), then run the
//! supervision loop until a termination signal.
//!
//! Shutdown: stop the loops, disconnect from the state store, kill every
//! process still tracked in the registry (best-effort, no graceful drain), and
//! return. SIGHUP is a plain termination request, same as SIGINT/SIGTERM.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{info, warn};

use crate::config::Config;
use crate::handlers::Handlers;
use crate::registry::Registry;
use crate::shadow::{Channel, MqttChannel, Topics, TransportError};
use crate::supervisor;
use crate::util::{expand_tilde, is_executable};

/// Fatal agent startup failures.
#[derive(Debug)]
pub enum AgentError {
    /// The configured proxy executable is missing or not executable.
    ProxyMissing(String),
    /// State-store connect/subscribe failed at startup.
    Transport(TransportError),
}

impl std::fmt::Display for AgentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentError::ProxyMissing(path) => {
                write!(f, "local proxy executable '{path}' is not executable or does not exist")
            }
            AgentError::Transport(e) => write!(f, "{e}"),
        }
    }
}

/// Run the agent until a termination signal arrives.
pub async fn run(config: Config) -> Result<(), AgentError> {
    let local_proxy = expand_tilde(&config.proxy.local_proxy).into_owned();
    if !is_executable(&local_proxy) {
        return Err(AgentError::ProxyMissing(local_proxy));
    }

    let client_id = config.device.client_id.clone();
    info!("device client id: {client_id}");
    let topics = Topics::for_client(&client_id);

    let (channel, events) = MqttChannel::connect(&config.mqtt, &client_id, Some(&topics))
        .await
        .map_err(AgentError::Transport)?;

    let registry = Registry::new();

    // Initial reported status; telemetry is best-effort from here on.
    let ready = json!({ "state": { "reported": { "status": "ready" } } });
    if let Err(e) = channel.publish_json(&topics.update, &ready).await {
        warn!("failed to report ready status: {e}");
    }

    let handlers = Handlers::new(
        Arc::new(config.clone()),
        registry.clone(),
        channel.clone(),
        topics.clone(),
    );
    let get_response_seen = handlers.get_response_seen();
    let dispatcher = tokio::spawn(handlers.run(events));

    // One shadow GET so a directive written while we were offline is picked up.
    if let Err(e) = channel.publish(&topics.get, b"{}".to_vec()).await {
        warn!("shadow get request failed: {e}");
    }
    let get_timeout = config.agent.get_timeout_secs;
    let watchdog = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(get_timeout)).await;
        if !get_response_seen.load(Ordering::Relaxed) {
            warn!("shadow get request timed out after {get_timeout}s");
        }
    });

    info!(
        "supervising tunnel processes every {}s",
        config.agent.monitor_interval_secs
    );
    tokio::select! {
        () = supervisor::run(
            registry.clone(),
            channel.clone(),
            topics.clone(),
            config.agent.monitor_interval_secs,
        ) => {}
        () = shutdown_signal() => {}
    }

    // Shutdown: stop event handling, drop the connection, reap all children.
    dispatcher.abort();
    watchdog.abort();
    info!("disconnecting from state store");
    if let Err(e) = channel.disconnect().await {
        warn!("state store disconnect failed: {e}");
    }
    registry.kill_all().await;
    info!("exiting");
    Ok(())
}

/// Resolves when SIGINT, SIGTERM, or SIGHUP is received.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to register SIGTERM");
        let mut sighup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
            .expect("Failed to register SIGHUP");
        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sighup.recv() => info!("Received SIGHUP"),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}
