//! Message routing between Messenger and the bus.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::bus::{BusMessage, COMM_SERVICE, MessageBus, OutgoingReply, ReplyRequest};
use crate::channels::outbound::OutboundSender;
use crate::pipeline::support::{KnownChannel, SupportChannelStore};
use crate::pipeline::types::{InboundMessage, RoutingEnvelope};

/// Kind tag marking a reply to a message that was waiting for an answer.
const NOT_OWNER_MESSAGE: &str = "not-owner-message";

/// Where a reply from the bus ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyRoute {
    /// Sent straight to the Messenger user.
    Direct { user_id: String },
    /// No automated answer; handed to a human on the support channel.
    Forwarded { channel: KnownChannel },
    /// Nothing to deliver to.
    Dropped,
}

pub struct MessageRouter {
    bot_key: String,
    bus: Arc<dyn MessageBus>,
    sender: Arc<OutboundSender>,
    support: Arc<SupportChannelStore>,
}

impl MessageRouter {
    pub fn new(
        bot_key: impl Into<String>,
        bus: Arc<dyn MessageBus>,
        sender: Arc<OutboundSender>,
        support: Arc<SupportChannelStore>,
    ) -> Self {
        Self {
            bot_key: bot_key.into(),
            bus,
            sender,
            support,
        }
    }

    /// Publish a gateway message to the communication manager.
    ///
    /// At most once: a failed publish is logged and the message is lost.
    pub async fn route_inbound(&self, message: InboundMessage) {
        let envelope = RoutingEnvelope::not_owner_message(&self.bot_key, &message);
        match self
            .bus
            .send(COMM_SERVICE, BusMessage::Envelope(envelope))
            .await
        {
            Ok(_) => debug!(sender = %message.sender_id, "Inbound message routed"),
            Err(e) => warn!(sender = %message.sender_id, "Failed to route inbound message: {e}"),
        }
    }

    /// Deliver a reply to its user, or forward it to support when the
    /// knowledge base had no answer.
    pub async fn route_reply(&self, reply: &ReplyRequest) -> ReplyRoute {
        let Some(user_id) = reply.ctx.as_deref().filter(|id| !id.is_empty()) else {
            warn!("Reply without a conversation context; dropping");
            return ReplyRoute::Dropped;
        };

        let unanswered = reply
            .addl
            .as_ref()
            .is_some_and(|addl| addl.kind.as_deref() == Some(NOT_OWNER_MESSAGE) && !addl.has_answer());

        if unanswered {
            let channel = self.forward_to_support(user_id, &reply.msg).await;
            return ReplyRoute::Forwarded { channel };
        }

        self.sender.deliver(user_id, &reply.msg).await;
        ReplyRoute::Direct {
            user_id: user_id.to_string(),
        }
    }

    async fn forward_to_support(&self, user_id: &str, text: &str) -> KnownChannel {
        let channel = self.support.current().await;
        let name = self.sender.display_name(user_id).await;
        let forwarded = format!("You got message from {name} <{user_id}>: {text}");

        let reply = OutgoingReply::to_channel(channel.channel_key(), None, forwarded);
        match self.bus.send(COMM_SERVICE, BusMessage::Reply(reply)).await {
            Ok(_) => info!(user_id, channel = %channel, "Forwarded unanswered message to support"),
            Err(e) => warn!(user_id, channel = %channel, "Failed to forward to support: {e}"),
        }
        channel
    }
}
