//! Notification handlers for inbound state-store events.
//!
//! A single dispatcher task consumes the classified event queue and fans out to
//! one handler per event type, each invoked with the immutable document
//! payload. The three inbound paths:
//!
//! - **Get-accepted** — a start directive under `state.desired` triggers the
//!   launch path; rejected responses are logged only.
//! - **Delta** — same launch path with fields inlined under `state`; deltas
//!   that are not tunnel starts are echoed to the control topic as INFO.
//! - **Update acks** — purely observational logging of our own writes.
//!
//! Every negative or failed outcome is contained here; nothing in this module
//! can crash the subscription or the supervision loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::directive::{self, DocumentKind, TunnelDirective};
use crate::launcher;
use crate::lease;
use crate::registry::Registry;
use crate::shadow::{status_payload, Channel, ShadowEvent, StatusKind, Topics};
use crate::util::expand_tilde;

/// Event dispatcher plus the state its handlers share.
pub struct Handlers<C: Channel> {
    config: Arc<Config>,
    registry: Registry,
    channel: C,
    topics: Topics,
    /// Set once any GET response arrives; the agent's GET watchdog reads it.
    get_response_seen: Arc<AtomicBool>,
}

impl<C: Channel> Handlers<C> {
    pub fn new(config: Arc<Config>, registry: Registry, channel: C, topics: Topics) -> Self {
        Self {
            config,
            registry,
            channel,
            topics,
            get_response_seen: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag the agent's GET-timeout watchdog observes.
    pub fn get_response_seen(&self) -> Arc<AtomicBool> {
        self.get_response_seen.clone()
    }

    /// Consume the event queue until the transport side closes it.
    pub async fn run(self, mut events: mpsc::Receiver<ShadowEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                ShadowEvent::GetAccepted(doc) => {
                    self.get_response_seen.store(true, Ordering::Relaxed);
                    self.on_get_accepted(&doc).await;
                }
                ShadowEvent::GetRejected(doc) => {
                    self.get_response_seen.store(true, Ordering::Relaxed);
                    warn!("shadow get request rejected");
                    debug!("get rejected payload: {doc}");
                }
                ShadowEvent::Delta(doc) => self.on_delta(&doc).await,
                ShadowEvent::UpdateAccepted(doc) => {
                    info!("shadow update accepted");
                    debug!("update accepted payload: {doc}");
                }
                ShadowEvent::UpdateRejected(doc) => {
                    warn!("shadow update rejected");
                    debug!("update rejected payload: {doc}");
                }
            }
        }
        info!("event queue closed, dispatcher stopping");
    }

    async fn on_get_accepted(&self, doc: &Value) {
        info!("shadow get accepted");
        debug!("get accepted payload: {doc}");

        match directive::extract(doc, DocumentKind::GetAccepted) {
            Some(directive) => self.start_from_directive(&directive).await,
            None => {
                let message = "no tunnel start in desired state";
                info!("{message}");
                self.report(StatusKind::Info, message).await;
            }
        }
    }

    async fn on_delta(&self, doc: &Value) {
        info!("shadow delta received");
        debug!("delta payload: {doc}");

        match directive::extract(doc, DocumentKind::Delta) {
            Some(directive) => self.start_from_directive(&directive).await,
            None => {
                let message = "delta not for tunnel start";
                info!("{message}");
                self.report(StatusKind::Info, message).await;
            }
        }
    }

    /// Launch path shared by both directive sources: adjust the lease for
    /// delivery delay, clamp it, spawn the destination-mode proxy, then clear
    /// the desired state and report the start.
    #[allow(clippy::cast_precision_loss)]
    async fn start_from_directive(&self, directive: &TunnelDirective) {
        let now = lease::unix_now();
        let adjusted = lease::adjust(
            directive.tunnel_lifetime as f64,
            directive.desired_timestamp,
            now,
        );
        let lifetime_minutes = lease::clamp(adjusted);
        if lifetime_minutes > adjusted {
            warn!(
                "directive lifetime already elapsed (adjusted: {adjusted:.2} min), \
                 clamping lease to {lifetime_minutes} min"
            );
        }

        let local_proxy = expand_tilde(&self.config.proxy.local_proxy).into_owned();
        let command = vec![
            local_proxy,
            "-d".to_string(),
            directive.endpoint.clone(),
            "-r".to_string(),
            directive.region.clone(),
        ];
        info!(
            "local_proxy_cmd: {} tunnel_lifetime: {} adjusted_tunnel_lifetime: {lifetime_minutes:.2}",
            command.join(" "),
            directive.tunnel_lifetime
        );

        let started = launcher::start_tunnel(
            &self.registry,
            &self.channel,
            &self.topics.control,
            &command,
            lifetime_minutes,
            &directive.access_token,
        )
        .await;

        // Clear the desired fields so the delta does not re-fire, and report
        // the initiation. Spawn failures were already reported by the launcher.
        if started.is_ok() {
            let update = json!({
                "state": {
                    "reported": { "status": "tunnel start initiated" },
                    "desired": null,
                }
            });
            if let Err(e) = self.channel.publish_json(&self.topics.update, &update).await {
                warn!("failed to clear desired state: {e}");
            }
        }
    }

    async fn report(&self, kind: StatusKind, message: &str) {
        if let Err(e) = self
            .channel
            .publish_json(&self.topics.control, &status_payload(kind, message))
            .await
        {
            warn!("status publish failed: {e}");
        }
    }
}
