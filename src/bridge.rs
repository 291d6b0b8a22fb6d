//! Bridge wiring: builds the pipeline and drives the bus event loop.

use std::sync::Arc;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::auth::{AuthChallenge, AuthChallengeHolder};
use crate::bus::{
    BusEvent, BusEventStream, BusMessage, COMM_SERVICE, HandlerRegistration, IncomingEvent,
    MessageBus,
};
use crate::channels::messenger::PlatformClient;
use crate::channels::outbound::OutboundSender;
use crate::channels::poller::spawn_gateway_poller;
use crate::config::BridgeConfig;
use crate::error::{AuthError, BusError};
use crate::pipeline::commands::{CommandOutcome, CommandProcessor, help_entries};
use crate::pipeline::router::MessageRouter;
use crate::pipeline::support::SupportChannelStore;
use crate::store::KeyValueStore;

/// Everything a bridge needs from the outside world.
pub struct BridgeDeps {
    pub bus: Arc<dyn MessageBus>,
    pub platform: Arc<dyn PlatformClient>,
    pub store: Arc<dyn KeyValueStore>,
    /// Client used for gateway polls; its timeout bounds each poll.
    pub http: reqwest::Client,
}

pub struct Bridge {
    config: Arc<BridgeConfig>,
    bus: Arc<dyn MessageBus>,
    http: reqwest::Client,
    auth: Arc<AuthChallengeHolder>,
    support: Arc<SupportChannelStore>,
    router: Arc<MessageRouter>,
    commands: CommandProcessor,
}

impl Bridge {
    /// Build the pipeline and load the persisted support channel.
    pub async fn new(config: Arc<BridgeConfig>, deps: BridgeDeps) -> Self {
        let sender = Arc::new(OutboundSender::new(deps.platform));
        let support = Arc::new(SupportChannelStore::new(deps.store));
        support.load().await;

        let auth = Arc::new(AuthChallengeHolder::new());
        let router = Arc::new(MessageRouter::new(
            config.bot_key.clone(),
            Arc::clone(&deps.bus),
            Arc::clone(&sender),
            Arc::clone(&support),
        ));
        let commands = CommandProcessor::new(
            Arc::clone(&deps.bus),
            sender,
            Arc::clone(&support),
            Arc::clone(&auth),
            config.gateway_base.clone(),
        );

        Self {
            config,
            bus: deps.bus,
            http: deps.http,
            auth,
            support,
            router,
            commands,
        }
    }

    pub fn router(&self) -> Arc<MessageRouter> {
        Arc::clone(&self.router)
    }

    pub fn support(&self) -> Arc<SupportChannelStore> {
        Arc::clone(&self.support)
    }

    pub fn auth(&self) -> Arc<AuthChallengeHolder> {
        Arc::clone(&self.auth)
    }

    /// Register as a `msg` handler with the communication manager.
    pub async fn register(&self) -> Result<(), BusError> {
        let registration = HandlerRegistration::new(self.config.bot_key.clone(), help_entries());
        self.bus
            .send(COMM_SERVICE, BusMessage::Register(registration))
            .await?;
        info!(key = %self.config.bot_key, "Registered command handler");
        Ok(())
    }

    /// Load the gateway auth challenge: `preset` if given, otherwise from the
    /// SSB service.
    pub async fn load_auth(
        &self,
        preset: Option<AuthChallenge>,
    ) -> Result<Arc<AuthChallenge>, AuthError> {
        info!("Loading auth challenge");
        let challenge = match preset {
            Some(challenge) => challenge,
            None => AuthChallenge::request(self.bus.as_ref()).await?,
        };
        self.auth.set(challenge)
    }

    /// Start polling the gateway if it and the auth challenge are available.
    pub fn start_polling(&self) -> Option<JoinHandle<()>> {
        spawn_gateway_poller(
            self.http.clone(),
            self.config.gateway_base.as_deref(),
            self.auth.get(),
            &self.config.poll,
            self.router(),
        )
    }

    /// Handle one bus event and acknowledge it.
    pub async fn handle_event(&self, mut incoming: IncomingEvent) {
        match &incoming.event {
            BusEvent::Msg(request) => {
                let outcome = self.commands.process(request).await;
                incoming.acknowledge(outcome == CommandOutcome::Handled);
            }
            BusEvent::Reply(reply) => {
                let route = self.router.route_reply(reply).await;
                debug!(?route, "Reply routed");
                incoming.acknowledge(true);
            }
        }
    }

    /// Process bus events one at a time until the stream ends.
    pub async fn run(&self, mut events: BusEventStream) {
        info!(bus = self.bus.name(), "Listening for bus events");
        while let Some(incoming) = events.next().await {
            self.handle_event(incoming).await;
        }
        warn!("Bus event stream ended");
    }
}
