//! Service-gateway poller: pulls inbound Messenger messages in a loop.
//!
//! The gateway buffers webhook deliveries for this bridge. Each cycle:
//! 1. GETs `<gateway>/<url-safe key>/msg` with basic auth
//! 2. Hands every parsed message to the router
//! 3. Picks the next delay from the backoff table
//!
//! Only one request is ever in flight. A successful poll is followed
//! immediately by the next one; failures walk up the backoff table and
//! the first success drops straight back to zero.

use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tracing::{Level, debug, error, info, warn};

use crate::auth::AuthChallenge;
use crate::config::{PollConfig, default_backoff};
use crate::pipeline::router::MessageRouter;
use crate::pipeline::types::InboundMessage;

/// The gateway answers 502 when the mailbox is empty.
pub const NO_MESSAGES_STATUS: StatusCode = StatusCode::BAD_GATEWAY;

/// Result classification of a single poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Gateway answered (2xx or 502); poll again immediately.
    Success,
    /// Network error or unexpected status; back off and retry.
    TransientFailure,
    /// The request cannot be issued at all; stop polling.
    PermanentFailure,
}

/// Messages and outcome of one poll.
#[derive(Debug)]
pub struct PollBatch {
    pub messages: Vec<InboundMessage>,
    pub outcome: PollOutcome,
}

impl PollBatch {
    fn failed(outcome: PollOutcome) -> Self {
        Self {
            messages: Vec::new(),
            outcome,
        }
    }
}

/// Backoff bookkeeping between poll cycles.
#[derive(Debug, Clone)]
pub struct PollState {
    intervals: Vec<Duration>,
    index: usize,
    pub last_error: Option<String>,
    pub last_status: Option<u16>,
}

impl PollState {
    /// An empty table falls back to the default so `index` is always valid.
    pub fn new(intervals: Vec<Duration>) -> Self {
        let intervals = if intervals.is_empty() {
            default_backoff()
        } else {
            intervals
        };
        Self {
            intervals,
            index: 0,
            last_error: None,
            last_status: None,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Delay before the next poll, updating the backoff position.
    ///
    /// `None` means polling should stop.
    pub fn next_delay(&mut self, outcome: PollOutcome) -> Option<Duration> {
        match outcome {
            PollOutcome::Success => {
                self.index = 0;
                Some(Duration::ZERO)
            }
            PollOutcome::TransientFailure => {
                let delay = self.intervals[self.index];
                if self.index + 1 < self.intervals.len() {
                    self.index += 1;
                }
                Some(delay)
            }
            PollOutcome::PermanentFailure => None,
        }
    }
}

/// 2xx and the gateway's "empty mailbox" 502 are both successes.
pub fn classify_status(status: StatusCode) -> PollOutcome {
    if status.is_success() || status == NO_MESSAGES_STATUS {
        PollOutcome::Success
    } else {
        PollOutcome::TransientFailure
    }
}

#[derive(Debug, Deserialize)]
struct GatewayEvent {
    sender: GatewaySender,
    message: GatewayMessage,
}

#[derive(Debug, Deserialize)]
struct GatewaySender {
    id: String,
}

#[derive(Debug, Deserialize)]
struct GatewayMessage {
    #[serde(default)]
    text: Option<String>,
}

/// Parse a gateway response body into messages.
///
/// An empty body is an empty batch. A body that is not a JSON array is
/// reported as `Err` so the caller can log it; it never counts as a poll
/// failure. Events without a sender id or text are skipped.
pub fn parse_batch(body: &str) -> Result<Vec<InboundMessage>, String> {
    if body.trim().is_empty() {
        return Ok(Vec::new());
    }

    let items: Vec<serde_json::Value> = match serde_json::from_str(body) {
        Ok(serde_json::Value::Array(items)) => items,
        Ok(other) => return Err(format!("expected an array, got {}", json_kind(&other))),
        Err(e) => return Err(format!("not JSON: {e}")),
    };

    Ok(items
        .into_iter()
        .filter_map(|item| match serde_json::from_value::<GatewayEvent>(item) {
            Ok(GatewayEvent {
                sender,
                message: GatewayMessage { text: Some(text) },
            }) => Some(InboundMessage::new(sender.id, text)),
            Ok(event) => {
                debug!(sender = %event.sender.id, "Skipping gateway event without text");
                None
            }
            Err(e) => {
                debug!("Skipping malformed gateway event: {e}");
                None
            }
        })
        .collect())
}

/// Proxies in front of the gateway answer an empty mailbox with an HTML
/// 502 page; that is routine and polled again immediately.
fn malformed_body_level(status: StatusCode) -> Level {
    if status == NO_MESSAGES_STATUS {
        Level::DEBUG
    } else {
        Level::WARN
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// Polls the service gateway for this bridge's mailbox.
pub struct GatewayPoller {
    client: reqwest::Client,
    url: String,
    auth: Arc<AuthChallenge>,
    state: PollState,
}

impl GatewayPoller {
    pub fn new(
        client: reqwest::Client,
        gateway_base: &str,
        auth: Arc<AuthChallenge>,
        config: &PollConfig,
    ) -> Self {
        let url = format!(
            "{}/{}/msg",
            gateway_base.trim_end_matches('/'),
            auth.url_safe_key()
        );
        Self {
            client,
            url,
            auth,
            state: PollState::new(config.backoff.clone()),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> &PollState {
        &self.state
    }

    /// Fetch one batch from the gateway.
    pub async fn poll_once(&mut self) -> PollBatch {
        let resp = match self
            .client
            .get(&self.url)
            .basic_auth(&self.auth.key, Some(self.auth.signed()))
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) if e.is_builder() => {
                error!(url = %self.url, "Gateway request cannot be built: {e}");
                self.state.last_error = Some(e.to_string());
                return PollBatch::failed(PollOutcome::PermanentFailure);
            }
            Err(e) => {
                warn!("Gateway poll error: {e}");
                self.state.last_error = Some(e.to_string());
                return PollBatch::failed(PollOutcome::TransientFailure);
            }
        };

        let status = resp.status();
        self.state.last_status = Some(status.as_u16());

        let outcome = classify_status(status);
        if outcome != PollOutcome::Success {
            warn!(status = status.as_u16(), "Gateway poll returned error status");
            self.state.last_error = Some(format!("gateway returned {status}"));
            return PollBatch::failed(outcome);
        }

        let body = match resp.text().await {
            Ok(body) => body,
            Err(e) => {
                warn!("Gateway body read error: {e}");
                self.state.last_error = Some(e.to_string());
                return PollBatch::failed(PollOutcome::TransientFailure);
            }
        };

        let messages = parse_batch(&body).unwrap_or_else(|reason| {
            if malformed_body_level(status) == Level::DEBUG {
                debug!(status = status.as_u16(), "Ignoring gateway body: {reason}");
            } else {
                warn!(status = status.as_u16(), "Ignoring gateway body: {reason}");
            }
            Vec::new()
        });

        self.state.last_error = None;
        PollBatch {
            messages,
            outcome: PollOutcome::Success,
        }
    }

    /// Poll until the gateway becomes permanently unusable.
    ///
    /// A request that cannot be built is the only exit; `spawn_gateway_poller`
    /// rejects gateway URLs that would cause it.
    pub async fn run(mut self, router: Arc<MessageRouter>) {
        info!(url = %self.url, "Gateway poller started");

        loop {
            let batch = self.poll_once().await;

            if !batch.messages.is_empty() {
                debug!(count = batch.messages.len(), "Fetched gateway messages");
            }
            for message in batch.messages {
                router.route_inbound(message).await;
            }

            let Some(delay) = self.state.next_delay(batch.outcome) else {
                error!("Gateway poller stopped; restart required");
                return;
            };

            if !delay.is_zero() {
                debug!(
                    delay_secs = delay.as_secs(),
                    backoff_index = self.state.index(),
                    "Backing off before next poll"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

fn validate_gateway_base(gateway_base: &str) -> Result<(), String> {
    let url = reqwest::Url::parse(gateway_base).map_err(|e| e.to_string())?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(format!("unsupported scheme {other:?}")),
    }
}

/// Spawn the poll loop if both the gateway and the auth challenge are known.
///
/// Returns `None` (after logging) when either is missing or the gateway URL
/// is not an absolute http(s) URL; call again once the configuration is fixed.
pub fn spawn_gateway_poller(
    client: reqwest::Client,
    gateway_base: Option<&str>,
    auth: Option<Arc<AuthChallenge>>,
    config: &PollConfig,
    router: Arc<MessageRouter>,
) -> Option<JoinHandle<()>> {
    let Some(gateway_base) = gateway_base else {
        warn!("Please add everlife service gateway (EVERLIFE_FB_SERVICE_GATEWAY); not polling");
        return None;
    };
    let Some(auth) = auth else {
        warn!("Auth challenge is missing for everlife service gateway; not polling");
        return None;
    };
    if let Err(reason) = validate_gateway_base(gateway_base) {
        error!(gateway = gateway_base, "Invalid everlife service gateway: {reason}; not polling");
        return None;
    }

    let poller = GatewayPoller::new(client, gateway_base, auth, config);
    Some(tokio::spawn(poller.run(router)))
}
