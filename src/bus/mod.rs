//! Message bus abstraction.
//!
//! The bridge talks to the rest of the system (communication manager,
//! knowledge base, SSB service) through request/response messages on a bus.
//! Transports implement [`MessageBus`]; the routing logic never sees them.

pub mod local;
pub mod stdio;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::error::BusError;
use crate::pipeline::types::{EnvelopeKind, RoutingEnvelope};

pub use local::LocalBus;
pub use stdio::StdioBus;

/// SSB service: issues the gateway auth challenge.
pub const SSB_SERVICE: &str = "everlife-ssb-svc";
/// Communication manager: receives envelopes, replies and registrations.
pub const COMM_SERVICE: &str = "everlife-communication-svc";

// ── Outbound messages ───────────────────────────────────────────────

/// Anything the bridge publishes on the bus.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum BusMessage {
    Envelope(RoutingEnvelope),
    Reply(OutgoingReply),
    Register(HandlerRegistration),
    ServiceAuth(ServiceAuthRequest),
}

impl BusMessage {
    pub fn service_auth() -> Self {
        BusMessage::ServiceAuth(ServiceAuthRequest {
            kind: "everlife-service-auth",
        })
    }
}

/// A reply routed by the communication manager to a channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutgoingReply {
    #[serde(rename = "type")]
    kind: EnvelopeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chan: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ctx: Option<String>,
    pub msg: String,
    /// Ask the manager to route to whichever channel the owner used last.
    #[serde(rename = "USELASTCHAN", skip_serializing_if = "is_false")]
    pub use_last_chan: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl OutgoingReply {
    /// Reply on whichever channel the owner last talked on.
    pub fn to_last_channel(msg: impl Into<String>) -> Self {
        Self {
            kind: EnvelopeKind::Reply,
            chan: None,
            ctx: None,
            msg: msg.into(),
            use_last_chan: true,
        }
    }

    /// Reply on a specific channel (and optional conversation context).
    pub fn to_channel(chan: impl Into<String>, ctx: Option<String>, msg: impl Into<String>) -> Self {
        Self {
            kind: EnvelopeKind::Reply,
            chan: Some(chan.into()),
            ctx,
            msg: msg.into(),
            use_last_chan: false,
        }
    }
}

/// One `/command` entry in the help shown by the communication manager.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HelpEntry {
    pub cmd: String,
    pub txt: String,
}

/// One-time registration of this bridge as a `msg` handler.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HandlerRegistration {
    #[serde(rename = "type")]
    kind: &'static str,
    pub mskey: String,
    pub mstype: String,
    pub mshelp: Vec<HelpEntry>,
}

impl HandlerRegistration {
    pub fn new(mskey: impl Into<String>, mshelp: Vec<HelpEntry>) -> Self {
        Self {
            kind: "register-msg-handler",
            mskey: mskey.into(),
            mstype: "msg".into(),
            mshelp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceAuthRequest {
    #[serde(rename = "type")]
    kind: &'static str,
}

// ── Inbound events ──────────────────────────────────────────────────

/// Events the bridge receives on its own key.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum BusEvent {
    /// Free text from the owner; may be one of our commands.
    Msg(CommandRequest),
    /// An answer to route back towards a Messenger user.
    Reply(ReplyRequest),
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CommandRequest {
    #[serde(default)]
    pub msg: Option<String>,
    #[serde(default)]
    pub chan: Option<String>,
    #[serde(default)]
    pub ctx: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ReplyRequest {
    /// Messenger user id the conversation belongs to.
    #[serde(default)]
    pub ctx: Option<String>,
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub addl: Option<ReplyAddl>,
}

/// Routing hints attached to a reply by the knowledge base.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ReplyAddl {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub ans: Option<serde_json::Value>,
}

impl ReplyAddl {
    /// Whether the knowledge base produced an answer (`ans` present and truthy).
    pub fn has_answer(&self) -> bool {
        use serde_json::Value;
        match &self.ans {
            None | Some(Value::Null) | Some(Value::Bool(false)) => false,
            Some(Value::String(s)) => !s.is_empty(),
            Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
            Some(Value::Array(_)) | Some(Value::Object(_)) | Some(Value::Bool(true)) => true,
        }
    }
}

/// A bus event plus the channel used to tell the sender whether we handled it.
#[derive(Debug)]
pub struct IncomingEvent {
    pub event: BusEvent,
    ack: Option<oneshot::Sender<bool>>,
}

impl IncomingEvent {
    pub fn new(event: BusEvent) -> Self {
        Self { event, ack: None }
    }

    pub fn with_ack(event: BusEvent, ack: oneshot::Sender<bool>) -> Self {
        Self {
            event,
            ack: Some(ack),
        }
    }

    /// Report back whether this bridge handled the event.
    pub fn acknowledge(&mut self, handled: bool) {
        if let Some(ack) = self.ack.take() {
            // Sender may have stopped waiting.
            let _ = ack.send(handled);
        }
    }
}

pub type BusEventStream = Pin<Box<dyn Stream<Item = IncomingEvent> + Send>>;

/// Request/response transport connecting the bridge to other services.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Transport name for logs.
    fn name(&self) -> &str;

    /// Send `message` to `service` and wait for its response payload.
    async fn send(
        &self,
        service: &str,
        message: BusMessage,
    ) -> Result<serde_json::Value, BusError>;

    /// Start receiving events addressed to `key`.
    async fn subscribe(&self, key: &str) -> Result<BusEventStream, BusError>;
}
