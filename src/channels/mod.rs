//! Messenger-facing I/O: gateway polling and platform delivery.

pub mod messenger;
pub mod outbound;
pub mod poller;

pub use messenger::{GraphApiClient, PlatformClient};
pub use outbound::OutboundSender;
pub use poller::{GatewayPoller, PollOutcome, PollState, spawn_gateway_poller};
