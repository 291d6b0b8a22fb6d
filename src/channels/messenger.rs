//! Facebook Messenger platform client: Send API and user profile lookup.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::error::ChannelError;

/// Maximum text length accepted by the Send API.
const MESSENGER_MAX_MESSAGE_LENGTH: usize = 2000;

/// Outbound operations against the chat platform.
#[async_trait]
pub trait PlatformClient: Send + Sync {
    /// Deliver `text` to the user identified by `user_id`.
    async fn send_message(&self, user_id: &str, text: &str) -> Result<(), ChannelError>;

    /// Resolve a user's display name.
    async fn lookup_user_name(&self, user_id: &str) -> Result<String, ChannelError>;
}

/// Graph API implementation of [`PlatformClient`].
pub struct GraphApiClient {
    api_base: String,
    page_access_token: Option<SecretString>,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct UserProfile {
    #[serde(default)]
    first_name: Option<String>,
    #[serde(default)]
    last_name: Option<String>,
}

impl GraphApiClient {
    pub fn new(
        api_base: impl Into<String>,
        page_access_token: Option<SecretString>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            page_access_token,
            client,
        }
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/{path}", self.api_base)
    }

    fn token(&self) -> Result<&str, ChannelError> {
        self.page_access_token
            .as_ref()
            .map(|t| t.expose_secret())
            .ok_or_else(|| ChannelError::AuthFailed {
                name: "messenger".into(),
                reason: "FACEBOOK_PAGE_ACCESS_TOKEN is not configured".into(),
            })
    }

    async fn send_message_chunk(
        &self,
        token: &str,
        user_id: &str,
        text: &str,
    ) -> Result<(), ChannelError> {
        let body = serde_json::json!({
            "recipient": { "id": user_id },
            "message": { "text": text },
        });

        let resp = self
            .client
            .post(self.api_url("me/messages"))
            .query(&[("access_token", token)])
            .json(&body)
            .send()
            .await
            .map_err(|e| ChannelError::SendFailed {
                name: "messenger".into(),
                reason: e.to_string(),
            })?;

        if resp.status() != reqwest::StatusCode::OK {
            let status = resp.status();
            let err = resp.text().await.unwrap_or_default();
            return Err(ChannelError::SendFailed {
                name: "messenger".into(),
                reason: format!("Send API returned {status}: {err}"),
            });
        }

        Ok(())
    }
}

#[async_trait]
impl PlatformClient for GraphApiClient {
    async fn send_message(&self, user_id: &str, text: &str) -> Result<(), ChannelError> {
        let token = self.token()?;
        for chunk in split_message(text, MESSENGER_MAX_MESSAGE_LENGTH) {
            self.send_message_chunk(token, user_id, &chunk).await?;
        }
        Ok(())
    }

    async fn lookup_user_name(&self, user_id: &str) -> Result<String, ChannelError> {
        let token = self.token()?;
        let resp = self
            .client
            .get(self.api_url(user_id))
            .query(&[("fields", "first_name,last_name"), ("access_token", token)])
            .send()
            .await
            .map_err(|e| ChannelError::Http(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(ChannelError::Http(format!(
                "profile lookup returned {}",
                resp.status()
            )));
        }

        let profile: UserProfile = resp
            .json()
            .await
            .map_err(|e| ChannelError::InvalidMessage(e.to_string()))?;

        display_name(&profile)
            .ok_or_else(|| ChannelError::InvalidMessage(format!("profile {user_id} has no name")))
    }
}

fn display_name(profile: &UserProfile) -> Option<String> {
    let name = [profile.first_name.as_deref(), profile.last_name.as_deref()]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    (!name.is_empty()).then_some(name)
}

/// Split a message into chunks that fit the platform's character limit.
/// Tries to split on newlines, then spaces, then hard-cuts.
fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    if text.chars().count() <= max_chars {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.chars().count() <= max_chars {
            chunks.push(remaining.to_string());
            break;
        }

        // Byte offset of the char boundary at `max_chars`.
        let limit = remaining
            .char_indices()
            .nth(max_chars)
            .map(|(i, _)| i)
            .unwrap_or(remaining.len());
        let window = &remaining[..limit];
        let split_at = window
            .rfind('\n')
            .or_else(|| window.rfind(' '))
            .filter(|i| *i > 0)
            .unwrap_or(limit);

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }

    chunks
}
