//! Controller — opens a tunnel and drives the source side.
//!
//! `sectun open` runs where the operator is: it requests a lease-bounded tunnel
//! from the brokering service, publishes a start directive (carrying the
//! destination token) to the target device's shadow, then launches the local
//! proxy in source mode bound to the source token and waits on it in the
//! foreground. The proxy is spawned by argument vector — endpoint and region
//! strings never pass through a shell.

use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use crate::config::Config;
use crate::launcher::ACCESS_TOKEN_ENV;
use crate::shadow::{Channel, MqttChannel, Topics, TransportError};
use crate::util::expand_tilde;

/// Options for one `sectun open` invocation.
pub struct OpenOptions {
    /// Client id of the target device.
    pub target: String,
    /// `host:port` the destination proxy should forward to (e.g. `localhost:22`).
    pub app_endpoint: String,
    /// Requested tunnel lifetime in minutes.
    pub lifetime_minutes: i64,
    /// Region override; defaults to `broker.region` from config.
    pub region: Option<String>,
    /// Local listen port override; defaults to `proxy.local_port` from config.
    pub local_port: Option<u16>,
}

/// Grant returned by the brokering service.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TunnelGrant {
    tunnel_id: String,
    source_access_token: String,
    destination_access_token: String,
}

/// Controller failures. All fatal — `open` is a one-shot operation.
#[derive(Debug)]
pub enum ControllerError {
    /// Brokering service unreachable, refused, or misconfigured.
    Broker(String),
    /// State-store connect or directive publish failed.
    Transport(TransportError),
    /// The local source-mode proxy could not be started.
    Proxy(String),
}

impl std::fmt::Display for ControllerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControllerError::Broker(e) => write!(f, "tunnel brokering failed: {e}"),
            ControllerError::Transport(e) => write!(f, "{e}"),
            ControllerError::Proxy(e) => write!(f, "local proxy failed: {e}"),
        }
    }
}

/// Open a tunnel to `opts.target` and run the source-side proxy until it exits
/// or the operator interrupts.
pub async fn open_tunnel(config: &Config, opts: OpenOptions) -> Result<(), ControllerError> {
    let region = opts
        .region
        .clone()
        .unwrap_or_else(|| config.broker.region.clone());
    let local_port = opts.local_port.unwrap_or(config.proxy.local_port);

    let grant = request_tunnel(config, opts.lifetime_minutes).await?;
    info!("tunnel opened: tunnel_id: {}", grant.tunnel_id);

    // Push the destination token and lease parameters to the device shadow.
    let controller_id = format!("{}_ctl", config.device.client_id);
    let (channel, _events) = MqttChannel::connect(&config.mqtt, &controller_id, None)
        .await
        .map_err(ControllerError::Transport)?;

    let target_topics = Topics::for_client(&opts.target);
    let directive = json!({
        "state": {
            "desired": {
                "tunnel": "start",
                "tunnel_lifetime": opts.lifetime_minutes,
                "endpoint": opts.app_endpoint,
                "region": region,
                "access_token": grant.destination_access_token,
            }
        }
    });
    info!("publishing start directive to {}", target_topics.update);
    debug!("start directive: {directive}");
    channel
        .publish_json(&target_topics.update, &directive)
        .await
        .map_err(ControllerError::Transport)?;

    run_source_proxy(config, local_port, &region, &grant.source_access_token).await?;

    let _ = channel.disconnect().await;
    Ok(())
}

async fn request_tunnel(config: &Config, lifetime_minutes: i64) -> Result<TunnelGrant, ControllerError> {
    let base = config.broker.url.trim_end_matches('/');
    if base.is_empty() {
        return Err(ControllerError::Broker(
            "broker.url is not configured".to_string(),
        ));
    }

    let response = reqwest::Client::new()
        .post(format!("{base}/tunnels"))
        .json(&json!({ "maxLifetimeMinutes": lifetime_minutes }))
        .send()
        .await
        .map_err(|e| ControllerError::Broker(e.to_string()))?
        .error_for_status()
        .map_err(|e| ControllerError::Broker(e.to_string()))?;

    response
        .json::<TunnelGrant>()
        .await
        .map_err(|e| ControllerError::Broker(format!("malformed grant: {e}")))
}

/// Spawn the source-mode proxy in the foreground and wait for it. Ctrl-C kills
/// the proxy and returns cleanly.
async fn run_source_proxy(
    config: &Config,
    local_port: u16,
    region: &str,
    source_token: &str,
) -> Result<(), ControllerError> {
    let local_proxy = expand_tilde(&config.proxy.local_proxy).into_owned();
    info!("starting local proxy: {local_proxy} -s {local_port} -r {region}");

    let mut child = tokio::process::Command::new(&local_proxy)
        .arg("-s")
        .arg(local_port.to_string())
        .arg("-r")
        .arg(region)
        .env(ACCESS_TOKEN_ENV, source_token)
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ControllerError::Proxy(format!("{local_proxy}: {e}")))?;
    info!("local proxy started with pid {:?}", child.id());

    tokio::select! {
        status = child.wait() => match status {
            Ok(s) => info!("local proxy exited: {s}"),
            Err(e) => return Err(ControllerError::Proxy(e.to_string())),
        },
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, stopping local proxy");
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grant_deserializes_camel_case() {
        let grant: TunnelGrant = serde_json::from_str(
            r#"{
                "tunnelId": "t-123",
                "sourceAccessToken": "SRC",
                "destinationAccessToken": "DST"
            }"#,
        )
        .unwrap();
        assert_eq!(grant.tunnel_id, "t-123");
        assert_eq!(grant.source_access_token, "SRC");
        assert_eq!(grant.destination_access_token, "DST");
    }

    #[tokio::test]
    async fn test_missing_broker_url_is_rejected() {
        let config: Config = toml::from_str("").unwrap();
        let err = request_tunnel(&config, 60).await.unwrap_err();
        assert!(matches!(err, ControllerError::Broker(_)));
    }
}
