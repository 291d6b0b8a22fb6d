//! Outbound delivery to Messenger users.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::channels::messenger::PlatformClient;

/// Delivers text to end users and resolves their names for forwarded messages.
///
/// Failures are logged and dropped: the user can always send again.
pub struct OutboundSender {
    client: Arc<dyn PlatformClient>,
}

impl OutboundSender {
    pub fn new(client: Arc<dyn PlatformClient>) -> Self {
        Self { client }
    }

    /// Send `text` to `user_id`. Returns whether the platform accepted it.
    pub async fn deliver(&self, user_id: &str, text: &str) -> bool {
        match self.client.send_message(user_id, text).await {
            Ok(()) => {
                info!(user_id, "Message sent successfully");
                true
            }
            Err(e) => {
                warn!(user_id, "Send message failed: {e}");
                false
            }
        }
    }

    /// Display name for `user_id`, or the raw id when the lookup fails.
    pub async fn display_name(&self, user_id: &str) -> String {
        match self.client.lookup_user_name(user_id).await {
            Ok(name) if !name.trim().is_empty() => name,
            Ok(_) => user_id.to_string(),
            Err(e) => {
                debug!(user_id, "User name lookup failed: {e}");
                user_id.to_string()
            }
        }
    }
}
