//! Publish channel and the production MQTT implementation.
//!
//! [`Channel`] is the narrow seam the rest of the crate publishes through, so
//! the launcher, supervisor, and notification handlers can be exercised in
//! tests with [`super::MockChannel`] instead of a broker.
//!
//! [`MqttChannel`] connects to the state store over mutually-authenticated TLS.
//! Inbound publishes are classified into [`ShadowEvent`]s by a driver task that
//! owns the rumqttc event loop and forwards them into a bounded queue; the
//! agent consumes that queue from a single dispatcher. Connect and subscribe
//! failures at startup are fatal; steady-state publish failures are the
//! caller's to log and swallow (status telemetry is fire-and-forget).

use std::time::Duration;

use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS, TlsConfiguration, Transport,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::MqttConfig;
use crate::shadow::{classify, ShadowEvent, Topics};

/// Queue depth for inbound shadow events. Shadow traffic for one device is a
/// trickle; anything beyond this means the dispatcher has stalled.
const EVENT_QUEUE_DEPTH: usize = 64;

/// State-store transport failures.
#[derive(Debug)]
pub enum TransportError {
    /// Could not establish or authenticate the connection.
    Connect(String),
    /// A subscribe request was refused or never acknowledged.
    Subscribe(String),
    /// A publish could not be handed to the client.
    Publish(String),
    /// Credential files could not be read.
    Credentials(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Connect(e) => write!(f, "state store connect failed: {e}"),
            TransportError::Subscribe(e) => write!(f, "subscribe failed: {e}"),
            TransportError::Publish(e) => write!(f, "publish failed: {e}"),
            TransportError::Credentials(e) => write!(f, "credential error: {e}"),
        }
    }
}

/// Fire-and-forget publish seam.
#[allow(async_fn_in_trait)]
pub trait Channel: Clone + Send + Sync + 'static {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Serialize `value` and publish it.
    async fn publish_json(
        &self,
        topic: &str,
        value: &serde_json::Value,
    ) -> Result<(), TransportError> {
        let payload =
            serde_json::to_vec(value).map_err(|e| TransportError::Publish(e.to_string()))?;
        self.publish(topic, payload).await
    }
}

/// Production channel over MQTT with mutual TLS.
#[derive(Clone)]
pub struct MqttChannel {
    client: AsyncClient,
}

impl MqttChannel {
    /// Connect to the state store and start the event-loop driver task.
    ///
    /// When `subscribe` is `Some`, the five inbound shadow topics for that
    /// identity are subscribed and classified events flow out of the returned
    /// receiver. Controllers that only publish pass `None` and drop the
    /// receiver.
    ///
    /// Fatal on connect timeout, TLS/credential failure, or subscribe refusal —
    /// the process has nothing useful to do without the state store.
    pub async fn connect(
        cfg: &MqttConfig,
        client_id: &str,
        subscribe: Option<&Topics>,
    ) -> Result<(Self, mpsc::Receiver<ShadowEvent>), TransportError> {
        let mut options = MqttOptions::new(client_id, &cfg.endpoint, cfg.port);
        options.set_keep_alive(Duration::from_secs(cfg.keep_alive_secs));
        options.set_transport(Transport::Tls(TlsConfiguration::Simple {
            ca: read_pem(&cfg.root_ca)?,
            alpn: None,
            client_auth: Some((read_pem(&cfg.cert)?, read_pem(&cfg.key)?)),
        }));

        let (client, mut eventloop) = AsyncClient::new(options, EVENT_QUEUE_DEPTH);

        // Wait for the broker to accept us before reporting ready.
        let connected = tokio::time::timeout(
            Duration::from_secs(cfg.connect_timeout_secs),
            wait_for_connack(&mut eventloop),
        )
        .await;
        match connected {
            Ok(Ok(())) => info!("connected to state store at {}:{}", cfg.endpoint, cfg.port),
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(TransportError::Connect(format!(
                    "timed out after {}s waiting for {}",
                    cfg.connect_timeout_secs, cfg.endpoint
                )))
            }
        }

        let subscriptions = subscribe.map(Topics::subscriptions).unwrap_or_default();
        for topic in &subscriptions {
            client
                .subscribe(topic, QoS::AtLeastOnce)
                .await
                .map_err(|e| TransportError::Subscribe(format!("{topic}: {e}")))?;
        }

        let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        tokio::spawn(drive(
            eventloop,
            client.clone(),
            subscribe.cloned(),
            subscriptions,
            tx,
        ));

        Ok((Self { client }, rx))
    }

    /// Disconnect from the broker. Best-effort; the driver task winds down when
    /// the connection drops.
    pub async fn disconnect(&self) -> Result<(), TransportError> {
        self.client
            .disconnect()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))
    }
}

impl Channel for MqttChannel {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))
    }
}

fn read_pem(path: &str) -> Result<Vec<u8>, TransportError> {
    std::fs::read(path).map_err(|e| TransportError::Credentials(format!("{path}: {e}")))
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), TransportError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
            Ok(_) => {}
            Err(e) => return Err(TransportError::Connect(e.to_string())),
        }
    }
}

/// Event-loop driver: polls the connection, re-subscribes after reconnects,
/// and forwards classified shadow events into the dispatcher queue.
async fn drive(
    mut eventloop: EventLoop,
    client: AsyncClient,
    topics: Option<Topics>,
    subscriptions: Vec<String>,
    tx: mpsc::Sender<ShadowEvent>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                // rumqttc does not replay subscriptions after a reconnect.
                info!("state store connection re-established");
                for topic in &subscriptions {
                    if let Err(e) = client.subscribe(topic, QoS::AtLeastOnce).await {
                        warn!("resubscribe to {topic} failed: {e}");
                    }
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let Some(ref topics) = topics else { continue };
                if let Some(event) = classify(topics, &publish.topic, &publish.payload) {
                    if tx.send(event).await.is_err() {
                        // Dispatcher is gone; the agent is shutting down.
                        return;
                    }
                } else {
                    debug!("ignoring message on {}", publish.topic);
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("broker requested disconnect");
            }
            Ok(_) => {}
            Err(e) => {
                if tx.is_closed() {
                    return;
                }
                warn!("state store connection error: {e}, retrying");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}
