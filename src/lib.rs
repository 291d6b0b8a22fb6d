//! Messenger bridge. Relays Facebook Messenger conversations through the
//! Everlife service gateway onto the internal message bus.

pub mod auth;
pub mod bridge;
pub mod bus;
pub mod channels;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod store;
