//! Operator commands arriving on the bus.
//!
//! | Command | Action |
//! |---|---|
//! | `/fbwebhookinfo` | reply with the webhook URL and verify token |
//! | `/tell <user> <text>` | send `<text>` to a Messenger user |
//! | `/use_for_support <channel>` | choose where unanswered messages go |

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::auth::AuthChallengeHolder;
use crate::bus::{
    BusMessage, COMM_SERVICE, CommandRequest, HelpEntry, MessageBus, OutgoingReply,
};
use crate::channels::outbound::OutboundSender;
use crate::pipeline::support::{KnownChannel, SupportChannelStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandName {
    WebhookInfo,
    Tell,
    UseForSupport,
}

impl CommandName {
    pub fn prefix(self) -> &'static str {
        match self {
            CommandName::WebhookInfo => "/fbwebhookinfo",
            CommandName::Tell => "/tell",
            CommandName::UseForSupport => "/use_for_support",
        }
    }

    fn help(self) -> &'static str {
        match self {
            CommandName::WebhookInfo => "Get facebook messenger webhook config details",
            CommandName::Tell => "/tell <user id> <message> - send a message to a messenger user",
            CommandName::UseForSupport => {
                "/use_for_support <channel> - forward unanswered messenger messages to this channel"
            }
        }
    }
}

/// Dispatch table, longest prefix first so no command shadows another.
const COMMAND_TABLE: [CommandName; 3] = [
    CommandName::UseForSupport,
    CommandName::WebhookInfo,
    CommandName::Tell,
];

/// Help entries registered with the communication manager.
pub fn help_entries() -> Vec<HelpEntry> {
    COMMAND_TABLE
        .iter()
        .map(|name| HelpEntry {
            cmd: name.prefix().to_string(),
            txt: name.help().to_string(),
        })
        .collect()
}

/// A parsed operator command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub name: CommandName,
    pub args: Vec<String>,
}

impl Command {
    /// Parse `text` into a command, or `None` if it isn't one of ours.
    pub fn parse(text: &str) -> Option<Self> {
        let name = COMMAND_TABLE
            .into_iter()
            .find(|name| text.starts_with(name.prefix()))?;
        let rest = text[name.prefix().len()..].trim();

        let args = match name {
            CommandName::WebhookInfo => Vec::new(),
            CommandName::Tell => match rest.split_once(char::is_whitespace) {
                Some((user, body)) => vec![user.to_string(), body.trim_start().to_string()],
                None if rest.is_empty() => Vec::new(),
                None => vec![rest.to_string()],
            },
            CommandName::UseForSupport => {
                if rest.is_empty() {
                    Vec::new()
                } else {
                    vec![rest.to_string()]
                }
            }
        };

        Some(Self { name, args })
    }
}

/// Whether the bridge acted on a bus message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    Handled,
    /// Not ours; other subscribers may still act on it.
    NotHandled,
}

pub struct CommandProcessor {
    bus: Arc<dyn MessageBus>,
    sender: Arc<OutboundSender>,
    support: Arc<SupportChannelStore>,
    auth: Arc<AuthChallengeHolder>,
    gateway_base: Option<String>,
}

impl CommandProcessor {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        sender: Arc<OutboundSender>,
        support: Arc<SupportChannelStore>,
        auth: Arc<AuthChallengeHolder>,
        gateway_base: Option<String>,
    ) -> Self {
        Self {
            bus,
            sender,
            support,
            auth,
            gateway_base,
        }
    }

    pub async fn process(&self, request: &CommandRequest) -> CommandOutcome {
        let Some(command) = request.msg.as_deref().and_then(Command::parse) else {
            return CommandOutcome::NotHandled;
        };
        debug!(command = command.name.prefix(), "Processing command");

        match command.name {
            CommandName::WebhookInfo => self.webhook_info().await,
            CommandName::Tell => self.tell(&command.args).await,
            CommandName::UseForSupport => self.use_for_support(request, &command.args).await,
        }
        CommandOutcome::Handled
    }

    async fn webhook_info(&self) {
        let text = match (self.gateway_base.as_deref(), self.auth.get()) {
            (Some(base), Some(auth)) => format!(
                "Facebook messenger webhook - {}/{}/webhook Verify token - {}",
                base.trim_end_matches('/'),
                auth.url_safe_key(),
                auth.signed()
            ),
            (None, _) => "Webhook info unavailable: everlife service gateway is not configured".into(),
            (_, None) => "Webhook info unavailable: auth challenge has not been loaded".into(),
        };
        self.reply(OutgoingReply::to_last_channel(text)).await;
    }

    /// `/tell <user> <text>`. Without a message body this is a silent no-op.
    async fn tell(&self, args: &[String]) {
        let [user_id, text] = args else {
            debug!("Ignoring /tell without a message body");
            return;
        };
        self.sender.deliver(user_id, text).await;
    }

    async fn use_for_support(&self, request: &CommandRequest, args: &[String]) {
        let selected = args.first().and_then(|name| KnownChannel::from_name(name));

        let text = match selected {
            Some(channel) => {
                self.support.save(channel).await;
                info!(channel = %channel, "Support channel changed");
                format!("Unanswered messenger messages will now be sent to {channel}")
            }
            None => format!(
                "Unknown channel '{}'. Valid channels: {}",
                args.first().map(String::as_str).unwrap_or_default(),
                KnownChannel::valid_names()
            ),
        };

        let reply = match request.chan.as_deref() {
            Some(chan) => OutgoingReply::to_channel(chan, request.ctx.clone(), text),
            None => OutgoingReply::to_last_channel(text),
        };
        self.reply(reply).await;
    }

    async fn reply(&self, reply: OutgoingReply) {
        if let Err(e) = self.bus.send(COMM_SERVICE, BusMessage::Reply(reply)).await {
            warn!("Failed to send command reply: {e}");
        }
    }
}
