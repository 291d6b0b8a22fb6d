use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};

use messenger_bridge::auth::AuthChallenge;
use messenger_bridge::bridge::{Bridge, BridgeDeps};
use messenger_bridge::bus::{MessageBus, StdioBus};
use messenger_bridge::channels::GraphApiClient;
use messenger_bridge::config::BridgeConfig;
use messenger_bridge::error::ChannelError;
use messenger_bridge::store::{KeyValueStore, LibSqlStore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Logs go to stderr; stdout carries the bus.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    run().await?;
    Ok(())
}

async fn run() -> messenger_bridge::error::Result<()> {
    let config = Arc::new(BridgeConfig::from_env()?);

    eprintln!("Messenger bridge v{}", env!("CARGO_PKG_VERSION"));
    eprintln!(
        "   Gateway: {}",
        config.gateway_base.as_deref().unwrap_or("(not configured)")
    );
    eprintln!(
        "   Send API: {} ({})",
        config.graph_api_base,
        if config.page_access_token.is_some() {
            "token set"
        } else {
            "no page token, replies disabled"
        }
    );

    // ── Store ───────────────────────────────────────────────────────────
    let store: Arc<dyn KeyValueStore> = match LibSqlStore::new_local(&config.db_path).await {
        Ok(store) => {
            eprintln!("   Database: {}", config.db_path.display());
            Arc::new(store)
        }
        Err(e) => {
            tracing::warn!(path = %config.db_path.display(), "Database unavailable, using memory: {e}");
            Arc::new(LibSqlStore::new_memory().await?)
        }
    };

    // ── HTTP ────────────────────────────────────────────────────────────
    let http = reqwest::Client::builder()
        .timeout(config.poll.request_timeout)
        .build()
        .map_err(|e| ChannelError::StartupFailed {
            name: "http".into(),
            reason: e.to_string(),
        })?;

    let platform = Arc::new(GraphApiClient::new(
        config.graph_api_base.clone(),
        config
            .page_access_token
            .as_ref()
            .map(|token| SecretString::from(token.expose_secret().to_string())),
        http.clone(),
    ));

    // ── Bridge ──────────────────────────────────────────────────────────
    let bus: Arc<dyn MessageBus> = Arc::new(StdioBus::new());
    let bridge = Bridge::new(
        Arc::clone(&config),
        BridgeDeps {
            bus: Arc::clone(&bus),
            platform,
            store,
            http,
        },
    )
    .await;

    if let Err(e) = bridge.register().await {
        tracing::warn!("Command handler registration failed: {e}");
    }

    match bridge.load_auth(AuthChallenge::from_env()).await {
        Ok(challenge) => tracing::info!(key = %challenge.key, "Auth challenge loaded"),
        Err(e) => tracing::error!("Could not load auth challenge: {e}"),
    }

    let _poller = bridge.start_polling();

    let events = bus.subscribe(&config.bot_key).await?;
    bridge.run(events).await;

    Ok(())
}
