//! Support channel selection.
//!
//! Messages the knowledge base can't answer are forwarded to a human on one
//! of the owner's other channels. The choice is persisted in the key/value
//! store and cached in memory.

use std::fmt;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::store::KeyValueStore;

/// Store key holding the selected channel's bus key.
pub const SUPPORT_CHANNEL_STORE_KEY: &str = "fb-messenger-support-channel";

/// Channels that can receive forwarded support messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KnownChannel {
    #[default]
    Telegram,
    Qwert,
}

impl KnownChannel {
    pub const ALL: [KnownChannel; 2] = [KnownChannel::Telegram, KnownChannel::Qwert];

    /// Operator-facing name, as typed in `/use_for_support`.
    pub fn name(self) -> &'static str {
        match self {
            KnownChannel::Telegram => "telegram",
            KnownChannel::Qwert => "qwert",
        }
    }

    /// Bus key of the channel's communication service.
    pub fn channel_key(self) -> &'static str {
        match self {
            KnownChannel::Telegram => "everlife-comm-telegram-svc",
            KnownChannel::Qwert => "everlife-comm-qwert-svc",
        }
    }

    /// Case-insensitive lookup by operator-facing name.
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        Self::ALL
            .into_iter()
            .find(|c| c.name().eq_ignore_ascii_case(name))
    }

    pub fn from_channel_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.channel_key() == key)
    }

    /// Comma separated list of valid names.
    pub fn valid_names() -> String {
        Self::ALL.map(KnownChannel::name).join(", ")
    }
}

impl fmt::Display for KnownChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Current support channel, backed by the key/value store.
pub struct SupportChannelStore {
    store: Arc<dyn KeyValueStore>,
    current: RwLock<KnownChannel>,
}

impl SupportChannelStore {
    /// Starts on the default channel; call [`load`](Self::load) to pick up
    /// the persisted selection.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            current: RwLock::new(KnownChannel::default()),
        }
    }

    /// Read the persisted selection into memory.
    ///
    /// Unset, unknown, or unreadable values resolve to the default channel.
    pub async fn load(&self) -> KnownChannel {
        let channel = match self.store.get(SUPPORT_CHANNEL_STORE_KEY).await {
            Ok(Some(key)) => KnownChannel::from_channel_key(&key).unwrap_or_else(|| {
                warn!(stored = %key, "Unknown support channel in store; using default");
                KnownChannel::default()
            }),
            Ok(None) => KnownChannel::default(),
            Err(e) => {
                warn!("Could not read support channel, using default: {e}");
                KnownChannel::default()
            }
        };
        *self.current.write().await = channel;
        info!(channel = %channel, "Support channel loaded");
        channel
    }

    pub async fn current(&self) -> KnownChannel {
        *self.current.read().await
    }

    /// Switch to `channel` now and persist it on a best-effort basis.
    ///
    /// The in-memory selection is kept even if persisting fails.
    pub async fn save(&self, channel: KnownChannel) {
        *self.current.write().await = channel;
        if let Err(e) = self
            .store
            .put(SUPPORT_CHANNEL_STORE_KEY, channel.channel_key())
            .await
        {
            warn!(channel = %channel, "Failed to persist support channel: {e}");
        }
    }
}
