//! Message routing pipeline: inbound envelopes, reply routing, operator commands.

pub mod commands;
pub mod router;
pub mod support;
pub mod types;

pub use commands::{Command, CommandOutcome, CommandProcessor};
pub use router::{MessageRouter, ReplyRoute};
pub use support::{KnownChannel, SupportChannelStore};
pub use types::{EnvelopeKind, InboundMessage, RoutingEnvelope};
