//! The top-level client: one handle owning the cache, the REST dispatcher,
//! the shard fleet, and the voice registry.

pub(crate) mod dispatch;
mod event;

use std::sync::Arc;

use secrecy::SecretString;
use tracing::debug;

pub use self::event::ClientEvent;
use crate::cache::{Cache, Settings};
use crate::gateway::{ShardManager, ShardManagerOptions};
use crate::http::Http;
use crate::model::gateway::{ActivityData, OnlineStatus, PresenceData};
use crate::voice::VoiceManager;
use crate::Result;

/// A builder for a [`Client`].
#[must_use]
pub struct ClientBuilder {
    token: String,
    cache_settings: Settings,
    presence: PresenceData,
    shard_total: Option<u16>,
}

impl ClientBuilder {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into().trim().to_string(),
            cache_settings: Settings::default(),
            presence: PresenceData::default(),
            shard_total: None,
        }
    }

    pub fn cache_settings(mut self, settings: Settings) -> Self {
        self.cache_settings = settings;
        self
    }

    /// The presence to identify with.
    pub fn presence(mut self, activity: Option<ActivityData>, status: OnlineStatus) -> Self {
        self.presence = PresenceData { activity, status };
        self
    }

    /// Overrides the shard count recommended by the service.
    pub fn shard_total(mut self, total: u16) -> Self {
        self.shard_total = Some(total);
        self
    }

    /// Fetches the gateway bootstrap information and assembles the client.
    /// No shard connects until [`Client::start`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Http`] when the bootstrap request fails.
    ///
    /// [`Error::Http`]: crate::Error::Http
    pub async fn build(self) -> Result<Client> {
        let http = Arc::new(Http::new(&self.token));

        let gateway = http.get_bot_gateway().await?;
        let shard_total = self.shard_total.or(gateway.shards).unwrap_or(1).max(1);
        debug!("Gateway at {}; using {shard_total} shard(s)", gateway.url);

        let cache = Arc::new(Cache::new(self.cache_settings));
        let (event_tx, event_rx) = tokio::sync::mpsc::unbounded_channel();
        let voice = VoiceManager::new(event_tx.clone());

        let shard_manager = ShardManager::new(ShardManagerOptions {
            token: SecretString::new(self.token),
            shard_total,
            ws_url: Arc::from(gateway.url.as_str()),
            event_tx,
            cache: Arc::clone(&cache),
            voice: Some(Arc::clone(&voice)),
            presence: Some(self.presence),
        });

        Ok(Client {
            cache,
            http,
            shard_manager,
            voice,
            event_rx,
        })
    }
}

/// The assembled client.
///
/// Events flow out through [`Self::recv_event`] in the order the shards
/// produced them; everything else is a shared handle the consumer can clone
/// out and use from other tasks.
pub struct Client {
    pub cache: Arc<Cache>,
    pub http: Arc<Http>,
    pub shard_manager: Arc<ShardManager>,
    pub voice: Arc<VoiceManager>,
    event_rx: tokio::sync::mpsc::UnboundedReceiver<ClientEvent>,
}

impl Client {
    /// Starts building a client for the given token.
    pub fn builder(token: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(token)
    }

    /// Boots every shard. Returns immediately; progress arrives as
    /// [`ClientEvent::Ready`] per shard and one
    /// [`ClientEvent::AllShardsReady`].
    pub async fn start(&self) {
        self.shard_manager.initialize().await;
    }

    /// The next client event, or `None` once every shard has stopped.
    pub async fn recv_event(&mut self) -> Option<ClientEvent> {
        self.event_rx.recv().await
    }

    /// Cleanly shuts every shard down.
    pub async fn shutdown(&self) {
        self.shard_manager.shutdown_all().await;
    }
}
