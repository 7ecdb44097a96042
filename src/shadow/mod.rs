//! State-store transport: shadow topics, event classification, status messages.
//!
//! The device state store speaks classic-shadow MQTT: a GET request/response
//! pair, UPDATE with accepted/rejected acks, and DELTA pushes whenever desired
//! state diverges from reported state. This module owns the topic layout for a
//! device identity, the classification of inbound publishes into typed
//! [`ShadowEvent`]s, and the small JSON status messages the agent emits on its
//! control topic.
//!
//! - `channel` — [`Channel`] trait and the production [`MqttChannel`]
//! - `mock` — [`MockChannel`] for tests without a broker

pub mod channel;
pub mod mock;

use serde_json::{json, Value};
use tracing::warn;

pub use channel::{Channel, MqttChannel, TransportError};
pub use mock::MockChannel;

/// Topic set for one device identity.
#[derive(Debug, Clone)]
pub struct Topics {
    /// Shadow GET request (publish an empty document here).
    pub get: String,
    pub get_accepted: String,
    pub get_rejected: String,
    /// Shadow UPDATE request (reported-state writes, desired-state clears).
    pub update: String,
    pub update_accepted: String,
    pub update_rejected: String,
    /// Desired-state change pushes.
    pub update_delta: String,
    /// Fixed per-device control topic for operator-facing status messages.
    pub control: String,
}

impl Topics {
    /// Build the topic set for a device client id.
    pub fn for_client(client_id: &str) -> Self {
        let shadow = format!("$aws/things/{client_id}/shadow");
        Self {
            get: format!("{shadow}/get"),
            get_accepted: format!("{shadow}/get/accepted"),
            get_rejected: format!("{shadow}/get/rejected"),
            update: format!("{shadow}/update"),
            update_accepted: format!("{shadow}/update/accepted"),
            update_rejected: format!("{shadow}/update/rejected"),
            update_delta: format!("{shadow}/update/delta"),
            control: format!("cmd/sectunnel/{client_id}/resp"),
        }
    }

    /// The inbound topics the agent subscribes to.
    pub fn subscriptions(&self) -> Vec<String> {
        vec![
            self.get_accepted.clone(),
            self.get_rejected.clone(),
            self.update_accepted.clone(),
            self.update_rejected.clone(),
            self.update_delta.clone(),
        ]
    }
}

/// One inbound state-store notification, already decoded.
///
/// Each variant carries the full document as delivered; nesting differences
/// between delta and get-accepted documents are resolved later by
/// `directive::extract`.
#[derive(Debug, Clone)]
pub enum ShadowEvent {
    GetAccepted(Value),
    GetRejected(Value),
    Delta(Value),
    UpdateAccepted(Value),
    UpdateRejected(Value),
}

/// Classify an inbound publish into a [`ShadowEvent`].
///
/// Returns `None` for unknown topics and for payloads that are not valid JSON
/// (logged, never fatal — a bad document must not crash the subscription).
pub fn classify(topics: &Topics, topic: &str, payload: &[u8]) -> Option<ShadowEvent> {
    let doc: Value = match serde_json::from_slice(payload) {
        Ok(v) => v,
        Err(e) => {
            warn!("malformed JSON on {topic}: {e}");
            return None;
        }
    };

    if topic == topics.update_delta {
        Some(ShadowEvent::Delta(doc))
    } else if topic == topics.get_accepted {
        Some(ShadowEvent::GetAccepted(doc))
    } else if topic == topics.get_rejected {
        Some(ShadowEvent::GetRejected(doc))
    } else if topic == topics.update_accepted {
        Some(ShadowEvent::UpdateAccepted(doc))
    } else if topic == topics.update_rejected {
        Some(ShadowEvent::UpdateRejected(doc))
    } else {
        None
    }
}

/// Severity of a control-topic status message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    Success,
    Error,
    Info,
    Warn,
}

impl StatusKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StatusKind::Success => "SUCCESS",
            StatusKind::Error => "ERROR",
            StatusKind::Info => "INFO",
            StatusKind::Warn => "WARN",
        }
    }
}

/// Build a `{"status", "message"}` control-topic payload.
pub fn status_payload(kind: StatusKind, message: &str) -> Value {
    json!({ "status": kind.as_str(), "message": message })
}
