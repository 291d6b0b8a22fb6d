//! Service-gateway credentials.
//!
//! The auth challenge is a (key, signed) pair issued by the SSB service. It
//! authenticates every gateway poll and doubles as the webhook verify token.
//! It is loaded once per process and never rotated.

use std::sync::{Arc, OnceLock};

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::bus::{BusMessage, MessageBus, SSB_SERVICE};
use crate::error::{AuthError, BusError};

/// Credential pair used as basic-auth user/password against the gateway.
#[derive(Debug)]
pub struct AuthChallenge {
    pub key: String,
    signed: SecretString,
}

#[derive(Deserialize)]
struct RawChallenge {
    key: String,
    signed: String,
}

impl AuthChallenge {
    pub fn new(key: impl Into<String>, signed: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            signed: SecretString::from(signed.into()),
        }
    }

    /// Static credentials from `EVERLIFE_AUTH_KEY` / `EVERLIFE_AUTH_SIGNED`.
    pub fn from_env() -> Option<Self> {
        let key = std::env::var("EVERLIFE_AUTH_KEY").ok()?;
        let signed = std::env::var("EVERLIFE_AUTH_SIGNED").ok()?;
        if key.is_empty() || signed.is_empty() {
            return None;
        }
        Some(Self::new(key, signed))
    }

    /// Ask the SSB service for the gateway auth challenge.
    pub async fn request(bus: &dyn MessageBus) -> Result<Self, AuthError> {
        let response = bus.send(SSB_SERVICE, BusMessage::service_auth()).await?;
        if response.is_null() {
            return Err(AuthError::Unavailable(format!(
                "{SSB_SERVICE} returned no challenge"
            )));
        }
        let raw: RawChallenge =
            serde_json::from_value(response).map_err(|e| BusError::InvalidResponse {
                service: SSB_SERVICE.into(),
                reason: e.to_string(),
            })?;
        Ok(Self::new(raw.key, raw.signed))
    }

    /// The signed secret (basic-auth password and webhook verify token).
    pub fn signed(&self) -> &str {
        self.signed.expose_secret()
    }

    /// The public key in the form the gateway uses as a path segment.
    pub fn url_safe_key(&self) -> String {
        to_url_safe_key(&self.key)
    }
}

/// Convert an SSB ed25519 id (`@<base64>.ed25519`) to URL-safe base64.
pub fn to_url_safe_key(key: &str) -> String {
    let raw = key.strip_prefix('@').unwrap_or(key);
    let raw = raw.strip_suffix(".ed25519").unwrap_or(raw);
    match STANDARD.decode(raw) {
        Ok(bytes) => URL_SAFE_NO_PAD.encode(bytes),
        Err(_) => raw
            .replace('+', "-")
            .replace('/', "_")
            .trim_end_matches('=')
            .to_string(),
    }
}

/// Write-once cell for the process-wide auth challenge.
#[derive(Debug, Default)]
pub struct AuthChallengeHolder {
    cell: OnceLock<Arc<AuthChallenge>>,
}

impl AuthChallengeHolder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the challenge. A second call is rejected and leaves the first in place.
    pub fn set(&self, challenge: AuthChallenge) -> Result<Arc<AuthChallenge>, AuthError> {
        let challenge = Arc::new(challenge);
        self.cell
            .set(Arc::clone(&challenge))
            .map_err(|_| AuthError::AlreadyLoaded)?;
        Ok(challenge)
    }

    pub fn get(&self) -> Option<Arc<AuthChallenge>> {
        self.cell.get().cloned()
    }
}
