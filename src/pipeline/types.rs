//! Shared types for message routing.

use serde::{Deserialize, Serialize};

/// A user message pulled from the service gateway.
///
/// Lives only for the duration of one routing dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Messenger page-scoped user id.
    pub sender_id: String,
    pub text: String,
}

impl InboundMessage {
    pub fn new(sender_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            sender_id: sender_id.into(),
            text: text.into(),
        }
    }
}

/// How downstream consumers should treat an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnvelopeKind {
    /// Plain message.
    Message,
    /// From someone other than the owner; awaiting an automated or human answer.
    NotOwnerMessage,
    /// Outgoing answer.
    Reply,
}

/// A routed message unit published to the communication manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingEnvelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    /// Channel key of the bridge that produced the envelope.
    pub chan: String,
    /// Conversation context (the Messenger user id).
    pub ctx: String,
    pub from: String,
    pub msg: String,
}

impl RoutingEnvelope {
    /// Envelope for a user message that still needs an answer.
    pub fn not_owner_message(chan: &str, message: &InboundMessage) -> Self {
        Self {
            kind: EnvelopeKind::NotOwnerMessage,
            chan: chan.to_string(),
            ctx: message.sender_id.clone(),
            from: message.sender_id.clone(),
            msg: message.text.clone(),
        }
    }
}
