//! In-memory channel for tests — records every publish instead of sending it.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;

use crate::shadow::{Channel, TransportError};

/// Test double for [`Channel`]. Clone-able; all clones share the same record.
#[derive(Clone, Default)]
pub struct MockChannel {
    published: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
}

impl MockChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// All publishes so far as `(topic, raw payload)` pairs.
    pub async fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.published.lock().await.clone()
    }

    /// All publishes so far with payloads decoded as JSON. Panics on a
    /// non-JSON payload — tests only ever publish JSON.
    pub async fn published_json(&self) -> Vec<(String, Value)> {
        self.published
            .lock()
            .await
            .iter()
            .map(|(topic, payload)| {
                (
                    topic.clone(),
                    serde_json::from_slice(payload).expect("payload is JSON"),
                )
            })
            .collect()
    }
}

impl Channel for MockChannel {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        self.published.lock().await.push((topic.to_string(), payload));
        Ok(())
    }
}
