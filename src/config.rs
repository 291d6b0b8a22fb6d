//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Service key this bridge answers on.
pub const BOT_KEY: &str = "everlife-comm-fb-msg-svc";

const DEFAULT_GRAPH_API_BASE: &str = "https://graph.facebook.com/v4.0";
const DEFAULT_BACKOFF_SECS: [u64; 6] = [1, 2, 5, 10, 30, 60];
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 60;
const DEFAULT_DB_PATH: &str = "./data/fb-bridge.db";

/// Gateway polling configuration.
#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Delays applied after consecutive failed polls; the last one repeats.
    pub backoff: Vec<Duration>,
    /// Upper bound for a single gateway request.
    pub request_timeout: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            backoff: default_backoff(),
            request_timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
        }
    }
}

/// Default backoff table: 1s, 2s, 5s, 10s, 30s, 60s.
pub fn default_backoff() -> Vec<Duration> {
    DEFAULT_BACKOFF_SECS
        .iter()
        .map(|s| Duration::from_secs(*s))
        .collect()
}

/// Bridge configuration, built once at startup and shared read-only.
#[derive(Debug)]
pub struct BridgeConfig {
    /// Key the bridge registers and publishes under.
    pub bot_key: String,
    /// Everlife service gateway base URL. Polling stays idle without it.
    pub gateway_base: Option<String>,
    /// Facebook page access token used for the Send API.
    pub page_access_token: Option<SecretString>,
    /// Graph API base URL (scheme, host and version).
    pub graph_api_base: String,
    pub poll: PollConfig,
    /// Location of the libSQL key/value database.
    pub db_path: PathBuf,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bot_key: BOT_KEY.to_string(),
            gateway_base: None,
            page_access_token: None,
            graph_api_base: DEFAULT_GRAPH_API_BASE.to_string(),
            poll: PollConfig::default(),
            db_path: PathBuf::from(DEFAULT_DB_PATH),
        }
    }
}

impl BridgeConfig {
    /// Build the configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let gateway_base = non_empty_var("EVERLIFE_FB_SERVICE_GATEWAY")
            .map(|url| url.trim_end_matches('/').to_string());

        let page_access_token = non_empty_var("FACEBOOK_PAGE_ACCESS_TOKEN").map(SecretString::from);

        let graph_api_base = non_empty_var("FACEBOOK_GRAPH_API_BASE")
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_GRAPH_API_BASE.to_string());

        let backoff = match non_empty_var("FB_BRIDGE_POLL_BACKOFF_SECS") {
            Some(raw) => parse_backoff(&raw).map_err(|message| ConfigError::InvalidValue {
                key: "FB_BRIDGE_POLL_BACKOFF_SECS".into(),
                message,
            })?,
            None => default_backoff(),
        };

        let request_timeout = match non_empty_var("FB_BRIDGE_HTTP_TIMEOUT_SECS") {
            Some(raw) => {
                let secs: u64 = raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                    key: "FB_BRIDGE_HTTP_TIMEOUT_SECS".into(),
                    message: format!("expected whole seconds, got {raw:?}"),
                })?;
                Duration::from_secs(secs)
            }
            None => Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
        };

        let db_path = non_empty_var("FB_BRIDGE_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH));

        Ok(Self {
            bot_key: BOT_KEY.to_string(),
            gateway_base,
            page_access_token,
            graph_api_base,
            poll: PollConfig {
                backoff,
                request_timeout,
            },
            db_path,
        })
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Parse a comma separated list of seconds into a backoff table.
pub fn parse_backoff(raw: &str) -> Result<Vec<Duration>, String> {
    let mut table = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let secs: u64 = part
            .parse()
            .map_err(|_| format!("{part:?} is not a whole number of seconds"))?;
        table.push(Duration::from_secs(secs));
    }
    if table.is_empty() {
        return Err("backoff table must list at least one interval".into());
    }
    Ok(table)
}
