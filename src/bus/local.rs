//! In-process bus.
//!
//! Records everything sent through it, answers requests from canned
//! per-service responses, and lets callers inject events for the bridge.
//! Used by tests and when embedding the bridge in another process.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc, oneshot};

use super::{BusEvent, BusEventStream, BusMessage, IncomingEvent, MessageBus};
use crate::error::BusError;

pub struct LocalBus {
    sent: Mutex<Vec<(String, BusMessage)>>,
    responses: Mutex<HashMap<String, serde_json::Value>>,
    failing: Mutex<HashSet<String>>,
    events_tx: mpsc::UnboundedSender<IncomingEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<IncomingEvent>>>,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalBus {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            sent: Mutex::new(Vec::new()),
            responses: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    /// Answer every request to `service` with `response`.
    pub async fn respond_with(&self, service: &str, response: serde_json::Value) {
        self.responses
            .lock()
            .await
            .insert(service.to_string(), response);
    }

    /// Make every request to `service` fail.
    pub async fn fail_service(&self, service: &str) {
        self.failing.lock().await.insert(service.to_string());
    }

    /// Messages sent so far, with the service they were addressed to.
    pub async fn sent(&self) -> Vec<(String, BusMessage)> {
        self.sent.lock().await.clone()
    }

    /// Messages sent to one service.
    pub async fn sent_to(&self, service: &str) -> Vec<BusMessage> {
        self.sent
            .lock()
            .await
            .iter()
            .filter(|(s, _)| s == service)
            .map(|(_, m)| m.clone())
            .collect()
    }

    /// Deliver an event to the subscriber. The receiver resolves with the
    /// subscriber's handled flag.
    pub fn deliver(&self, event: BusEvent) -> oneshot::Receiver<bool> {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self
            .events_tx
            .send(IncomingEvent::with_ack(event, ack_tx))
            .is_err()
        {
            tracing::debug!("Local bus subscriber gone; event dropped");
        }
        ack_rx
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    fn name(&self) -> &str {
        "local"
    }

    async fn send(
        &self,
        service: &str,
        message: BusMessage,
    ) -> Result<serde_json::Value, BusError> {
        if self.failing.lock().await.contains(service) {
            return Err(BusError::SendFailed {
                service: service.to_string(),
                reason: "service unavailable".into(),
            });
        }

        self.sent
            .lock()
            .await
            .push((service.to_string(), message));

        Ok(self
            .responses
            .lock()
            .await
            .get(service)
            .cloned()
            .unwrap_or(serde_json::Value::Null))
    }

    async fn subscribe(&self, key: &str) -> Result<BusEventStream, BusError> {
        let rx = self
            .events_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| BusError::SubscribeFailed {
                key: key.to_string(),
                reason: "local bus already has a subscriber".into(),
            })?;

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });

        Ok(Box::pin(stream))
    }
}
