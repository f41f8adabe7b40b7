use std::borrow::Cow;
use std::sync::Arc;

use futures::channel::mpsc::{self, UnboundedReceiver as Receiver, UnboundedSender as Sender};
use secrecy::{ExposeSecret, SecretString};
use tokio::time::{sleep, Duration, Instant};
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, trace, warn};
use url::Url;

use super::{
    ChunkGuildFilter, GatewayError, HeartbeatStatus, ReconnectType, Shard, ShardAction,
    ShardManager, WsClient,
};
use crate::bucket::TokenBucket;
use crate::cache::Cache;
use crate::client::{dispatch, ClientEvent};
use crate::constants;
use crate::model::event::Event;
use crate::model::gateway::{ActivityData, OnlineStatus};
use crate::model::id::{ChannelId, GuildId};
use crate::voice::VoiceManager;
use crate::{Error, Result};

/// Base delay for reconnect backoff; doubles per consecutive failure.
const RECONNECT_BASE: Duration = Duration::from_secs(1);
/// Backoff never exceeds this, however many attempts have failed.
const RECONNECT_CAP: Duration = Duration::from_secs(120);
/// Presence updates allowed per shard per minute.
const PRESENCE_LIMIT: u32 = 5;

/// A message to send from the manager or another handle to a [`ShardRunner`].
#[derive(Debug)]
pub enum ShardRunnerMessage {
    /// Tear the session down and start over with a fresh identify.
    Restart,
    /// Close the connection and stop the runner.
    Shutdown(u16),
    /// Request member chunks for a guild.
    ChunkGuild {
        guild_id: GuildId,
        limit: Option<u16>,
        filter: ChunkGuildFilter,
        nonce: Option<String>,
    },
    /// Set the shard's activity, keeping the rest of the presence.
    SetActivity(Option<ActivityData>),
    /// Set the shard's full presence.
    SetPresence(Option<ActivityData>, OnlineStatus),
    /// Set the shard's online status, keeping the rest of the presence.
    SetStatus(OnlineStatus),
    /// Join, move within, or leave (with `channel_id` of `None`) a guild's
    /// voice channels.
    UpdateVoiceState {
        guild_id: GuildId,
        channel_id: Option<ChannelId>,
        self_mute: bool,
        self_deaf: bool,
    },
    /// Send a raw WebSocket message, unmodified.
    Message(Message),
}

/// Drives one [`Shard`]: owns its WebSocket, feeds inbound frames through
/// the state machine, performs the actions it decides on, and forwards
/// dispatch events into the cache and out over the client's event channel.
#[must_use]
pub struct ShardRunner {
    shard: Shard,
    client: Option<WsClient>,
    manager: Arc<ShardManager>,
    // Channel pair for messages from the manager and messengers.
    runner_rx: Receiver<ShardRunnerMessage>,
    runner_tx: Sender<ShardRunnerMessage>,
    cache: Arc<Cache>,
    event_tx: tokio::sync::mpsc::UnboundedSender<ClientEvent>,
    voice: Option<Arc<VoiceManager>>,
    token: SecretString,
    ws_url: Arc<str>,
    identify_bucket: Arc<TokenBucket>,
    presence_bucket: TokenBucket,
    /// Whether a throttled presence update is waiting for a token. Only the
    /// latest presence matters, so this is a flag rather than a queue.
    presence_pending: bool,
    reconnect_attempts: u32,
}

impl ShardRunner {
    pub fn new(opt: ShardRunnerOptions) -> Self {
        let (tx, rx) = mpsc::unbounded();

        Self {
            shard: opt.shard,
            client: None,
            manager: opt.manager,
            runner_rx: rx,
            runner_tx: tx,
            cache: opt.cache,
            event_tx: opt.event_tx,
            voice: opt.voice,
            token: opt.token,
            ws_url: opt.ws_url,
            identify_bucket: opt.identify_bucket,
            presence_bucket: TokenBucket::new(PRESENCE_LIMIT, Duration::from_secs(60)),
            presence_pending: false,
            reconnect_attempts: 0,
        }
    }

    /// Clones the sending half of the runner's message channel.
    pub(super) fn runner_tx(&self) -> Sender<ShardRunnerMessage> {
        self.runner_tx.clone()
    }

    /// Runs the shard until it is shut down or hits a fatal error.
    ///
    /// Each loop iteration drains pending runner messages, reconnects the
    /// transport if needed, checks the heartbeat schedule, then reads one
    /// frame (bounded wait) and acts on whatever the state machine decides.
    ///
    /// # Errors
    ///
    /// Returns the fatal [`Error::Gateway`] when the service rejects the
    /// connection in a way reconnecting cannot fix; the shard is left
    /// disconnected.
    pub async fn run(mut self) -> Result<()> {
        info!("[ShardRunner {}] Running", self.shard.shard_info());

        loop {
            trace!("[ShardRunner {}] loop iteration", self.shard.shard_info());

            if !self.drain_messages().await? {
                self.invalidate_voice();
                self.update_manager().await;
                return Ok(());
            }

            if self.client.is_none() {
                if let Err(why) = self.connect_transport().await {
                    self.surface_fatal(&why);
                    self.invalidate_voice();
                    self.update_manager().await;
                    return Err(why);
                }
                self.update_manager().await;
                continue;
            }

            if self.presence_pending && self.presence_bucket.try_acquire() {
                self.presence_pending = false;
                self.flush_presence().await;
            }

            match self.shard.check_heartbeat(Instant::now()) {
                HeartbeatStatus::NotDue => {},
                HeartbeatStatus::Due => {
                    if let Err(why) = self.send_heartbeat().await {
                        warn!(
                            "[ShardRunner {}] Err heartbeating: {why:?}",
                            self.shard.shard_info()
                        );
                        self.begin_reconnect(self.shard.reconnection_type()).await;
                        continue;
                    }
                },
                HeartbeatStatus::Zombie => {
                    warn!(
                        "[ShardRunner {}] Heartbeat not acknowledged; connection is a zombie",
                        self.shard.shard_info()
                    );
                    self.begin_reconnect(self.shard.reconnection_type()).await;
                    continue;
                },
            }

            let pre = self.shard.stage();
            self.read_and_handle_frame().await?;
            if self.shard.stage() != pre {
                self.update_manager().await;
            }
        }
    }

    /// Reads one frame (or times out quietly) and routes it through the
    /// state machine.
    async fn read_and_handle_frame(&mut self) -> Result<()> {
        let Some(client) = self.client.as_mut() else { return Ok(()) };

        let event = match client.recv_json().await {
            Ok(Some(event)) => event,
            Ok(None) => return Ok(()),
            Err(Error::Gateway(GatewayError::Closed(frame))) => {
                match self.shard.handle_close(frame.as_ref()) {
                    Ok(action) => {
                        self.perform(action).await;
                    },
                    // Only errors reconnecting cannot fix stop the runner.
                    Err(Error::Gateway(why)) if why.is_fatal() => {
                        let why = Error::Gateway(why);
                        self.surface_fatal(&why);
                        self.invalidate_voice();
                        return Err(why);
                    },
                    Err(why) => {
                        warn!(
                            "[ShardRunner {}] Err handling close: {why:?}",
                            self.shard.shard_info()
                        );
                        self.begin_reconnect(self.shard.reconnection_type()).await;
                    },
                }

                return Ok(());
            },
            Err(Error::Tungstenite(why)) => {
                warn!("[ShardRunner {}] Websocket error: {why:?}", self.shard.shard_info());
                self.begin_reconnect(self.shard.reconnection_type()).await;
                return Ok(());
            },
            Err(why) => {
                // Undecodable frame; the connection itself is fine.
                warn!("[ShardRunner {}] Err decoding frame: {why:?}", self.shard.shard_info());
                return Ok(());
            },
        };

        let (action, event) = self.shard.handle_event(event, Instant::now());

        if let Some(action) = action {
            self.perform(action).await;
        }

        if let Some(event) = event {
            self.handle_dispatch_event(event).await;
        }

        Ok(())
    }

    /// Performs an action decided by the state machine.
    async fn perform(&mut self, action: ShardAction) {
        let result = match action {
            ShardAction::Heartbeat => self.send_heartbeat().await,
            ShardAction::Identify => self.send_identify().await,
            ShardAction::Resume => self.send_resume().await,
            ShardAction::Reconnect(kind) => {
                self.begin_reconnect(kind).await;
                return;
            },
        };

        if let Err(why) = result {
            debug!(
                "[ShardRunner {}] Reconnecting due to error performing action: {why:?}",
                self.shard.shard_info()
            );
            self.begin_reconnect(self.shard.reconnection_type()).await;
        }
    }

    async fn send_heartbeat(&mut self) -> Result<()> {
        let client = self.client.as_mut().ok_or(Error::Other("transport not open"))?;

        client.send_heartbeat(&self.shard.shard_info(), Some(self.shard.seq())).await?;
        self.shard.heartbeat_sent(Instant::now());

        trace!("[ShardRunner {}] Heartbeat", self.shard.shard_info());
        Ok(())
    }

    async fn send_identify(&mut self) -> Result<()> {
        // One identify per window across the whole fleet.
        self.identify_bucket.acquire().await;

        let client = self.client.as_mut().ok_or(Error::Other("transport not open"))?;
        client
            .send_identify(
                &self.shard.shard_info(),
                self.token.expose_secret(),
                self.shard.presence(),
            )
            .await?;
        self.shard.set_identifying();

        Ok(())
    }

    async fn send_resume(&mut self) -> Result<()> {
        let session_id = self
            .shard
            .session_id()
            .ok_or(Error::Gateway(GatewayError::NoSessionId))?
            .to_owned();

        let seq = self.shard.seq();
        let shard_info = self.shard.shard_info();
        let client = self.client.as_mut().ok_or(Error::Other("transport not open"))?;
        client.send_resume(&shard_info, &session_id, seq, self.token.expose_secret()).await?;
        self.shard.set_resuming();

        Ok(())
    }

    /// Tears the transport down and leaves reconnection to the next loop
    /// iteration. A reidentify also forgets the session, which invalidates
    /// any voice connections riding on it.
    ///
    /// Every teardown counts toward the backoff, so a service that accepts
    /// connections and drops them right after still sees growing delays.
    async fn begin_reconnect(&mut self, kind: ReconnectType) {
        info!("[ShardRunner {}] Reconnecting ({kind:?})", self.shard.shard_info());

        self.reconnect_attempts = self.reconnect_attempts.saturating_add(1);

        if let Some(mut client) = self.client.take() {
            drop(client.close(Some(CloseFrame {
                code: 4000.into(),
                reason: Cow::from(""),
            }))
            .await);
        }

        if kind == ReconnectType::Reidentify {
            self.shard.reset();
            self.invalidate_voice();
        }

        self.update_manager().await;
    }

    /// Opens the transport, backing off exponentially on failure.
    ///
    /// The backoff counter resets on Ready or Resumed, never on a
    /// successful dial.
    async fn connect_transport(&mut self) -> Result<()> {
        if self.reconnect_attempts > 0 {
            let exp = 2u32.saturating_pow(self.reconnect_attempts.saturating_sub(1));
            let delay = RECONNECT_BASE.saturating_mul(exp).min(RECONNECT_CAP);
            let jitter = Duration::from_millis(u64::from(rand::random::<u16>()) % 1000);

            debug!(
                "[ShardRunner {}] Waiting {:?} before reconnect attempt {}",
                self.shard.shard_info(),
                delay + jitter,
                self.reconnect_attempts,
            );
            sleep(delay + jitter).await;
        }

        let base = match self.shard.reconnection_type() {
            ReconnectType::Resume => {
                self.shard.resume_ws_url().unwrap_or(&self.ws_url).to_owned()
            },
            ReconnectType::Reidentify => self.ws_url.to_string(),
        };
        let url = connect_url(&base)?;

        self.shard.set_connecting();
        match WsClient::connect(&url).await {
            Ok(client) => {
                self.client = Some(client);
                self.shard.set_handshake(Instant::now());
            },
            Err(why) => {
                warn!(
                    "[ShardRunner {}] Failed to connect: {why:?}",
                    self.shard.shard_info()
                );
                self.reconnect_attempts = self.reconnect_attempts.saturating_add(1);
            },
        }

        Ok(())
    }

    /// Reacts to a dispatch event at the runner level, then applies it to
    /// the cache and forwards the result to the client channel.
    async fn handle_dispatch_event(&mut self, event: Event) {
        match &event {
            Event::Ready(ready) => {
                self.reconnect_attempts = 0;

                let shard_id = self.shard.shard_info().id;
                if let Some(voice) = &self.voice {
                    voice.set_user_id(ready.user.id);
                    voice.register_shard(
                        shard_id,
                        self.shard.shard_info().total,
                        super::ShardMessenger::from_tx(self.runner_tx.clone()),
                    );
                }

                self.manager.notify_ready(shard_id).await;
            },
            Event::Resumed => {
                self.reconnect_attempts = 0;
            },
            Event::GuildCreate(payload) if payload.guild.large => {
                // Large guilds arrive without their member list; sync it in
                // chunks.
                if let Some(client) = self.client.as_mut() {
                    let guild_id = payload.guild.id;
                    let shard_info = self.shard.shard_info();
                    if let Err(why) = client
                        .send_chunk_guild(guild_id, &shard_info, None, ChunkGuildFilter::None, None)
                        .await
                    {
                        warn!("[ShardRunner {shard_info}] Err requesting chunks: {why:?}");
                    }
                }
            },
            Event::VoiceStateUpdate(state) => {
                if let Some(voice) = &self.voice {
                    voice.state_update(state);
                }
            },
            Event::VoiceServerUpdate(update) => {
                if let Some(voice) = &self.voice {
                    voice.server_update(update);
                }
            },
            _ => {},
        }

        if let Some(client_event) =
            dispatch::update_cache(&self.cache, self.shard.shard_info().id, event)
        {
            drop(self.event_tx.send(client_event));
        }
    }

    /// Drains pending runner messages. Returns `false` when the runner
    /// should stop.
    async fn drain_messages(&mut self) -> Result<bool> {
        loop {
            match self.runner_rx.try_next() {
                Ok(Some(msg)) => {
                    if !self.handle_message(msg).await {
                        return Ok(false);
                    }
                },
                Ok(None) => {
                    warn!(
                        "[ShardRunner {}] Sending half dropped; stopping",
                        self.shard.shard_info()
                    );
                    return Ok(false);
                },
                Err(_) => return Ok(true),
            }
        }
    }

    async fn handle_message(&mut self, msg: ShardRunnerMessage) -> bool {
        match msg {
            ShardRunnerMessage::Restart => {
                self.begin_reconnect(ReconnectType::Reidentify).await;
                true
            },
            ShardRunnerMessage::Shutdown(code) => {
                info!("[ShardRunner {}] Shutting down", self.shard.shard_info());

                if let Some(mut client) = self.client.take() {
                    drop(client.close(Some(CloseFrame {
                        code: code.into(),
                        reason: Cow::from(""),
                    }))
                    .await);
                }
                self.shard.reset();
                self.invalidate_voice();

                false
            },
            ShardRunnerMessage::ChunkGuild {
                guild_id,
                limit,
                filter,
                nonce,
            } => {
                if let Some(client) = self.client.as_mut() {
                    let shard_info = self.shard.shard_info();
                    drop(
                        client
                            .send_chunk_guild(guild_id, &shard_info, limit, filter, nonce.as_deref())
                            .await,
                    );
                }
                true
            },
            ShardRunnerMessage::SetActivity(activity) => {
                self.shard.set_activity(activity);
                self.send_presence_update().await;
                true
            },
            ShardRunnerMessage::SetPresence(activity, status) => {
                self.shard.set_presence(activity, status);
                self.send_presence_update().await;
                true
            },
            ShardRunnerMessage::SetStatus(status) => {
                self.shard.set_status(status);
                self.send_presence_update().await;
                true
            },
            ShardRunnerMessage::UpdateVoiceState {
                guild_id,
                channel_id,
                self_mute,
                self_deaf,
            } => {
                if let Some(client) = self.client.as_mut() {
                    let shard_info = self.shard.shard_info();
                    drop(
                        client
                            .send_voice_state_update(
                                &shard_info,
                                guild_id,
                                channel_id,
                                self_mute,
                                self_deaf,
                            )
                            .await,
                    );
                }
                true
            },
            ShardRunnerMessage::Message(message) => {
                if let Some(client) = self.client.as_mut() {
                    drop(client.send(message).await);
                }
                true
            },
        }
    }

    /// Sends the shard's presence if the throttle has a token; otherwise
    /// flags it for the run loop to flush later. The shard state already
    /// holds the latest presence, so coalescing loses nothing, and the read
    /// loop never waits on the throttle.
    async fn send_presence_update(&mut self) {
        if !self.presence_bucket.try_acquire() {
            self.presence_pending = true;
            return;
        }

        self.flush_presence().await;
    }

    async fn flush_presence(&mut self) {
        let shard_info = self.shard.shard_info();
        if let Some(client) = self.client.as_mut() {
            if let Err(why) = client.send_presence_update(&shard_info, self.shard.presence()).await
            {
                warn!("[ShardRunner {shard_info}] Err sending presence update: {why:?}");
            }
        }
    }

    /// Tears down the voice sessions riding on this shard, if any.
    fn invalidate_voice(&self) {
        if let Some(voice) = &self.voice {
            voice.deregister_shard(self.shard.shard_info().id);
        }
    }

    fn surface_fatal(&self, error: &Error) {
        if let Error::Gateway(gateway_error) = error {
            drop(self.event_tx.send(ClientEvent::ShardFatal {
                shard_id: self.shard.shard_info().id,
                error: gateway_error.clone(),
            }));
        }
    }

    async fn update_manager(&self) {
        self.manager
            .update_shard_latency_and_stage(
                self.shard.shard_info().id,
                self.shard.latency(),
                self.shard.stage(),
            )
            .await;
    }
}

/// Options to be passed to [`ShardRunner::new`].
pub struct ShardRunnerOptions {
    pub shard: Shard,
    pub manager: Arc<ShardManager>,
    pub cache: Arc<Cache>,
    pub event_tx: tokio::sync::mpsc::UnboundedSender<ClientEvent>,
    pub voice: Option<Arc<VoiceManager>>,
    pub token: SecretString,
    pub ws_url: Arc<str>,
    pub identify_bucket: Arc<TokenBucket>,
}

fn connect_url(base: &str) -> Result<Url> {
    Url::parse(&format!("{base}?v={}", constants::GATEWAY_VERSION)).map_err(|why| {
        warn!("Error building gateway URL with base `{base}`: {why:?}");
        Error::Gateway(GatewayError::BuildingUrl)
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use secrecy::SecretString;
    use tokio::time::{Duration, Instant};

    use super::{ShardRunner, ShardRunnerMessage, ShardRunnerOptions};
    use crate::bucket::TokenBucket;
    use crate::cache::Cache;
    use crate::client::ClientEvent;
    use crate::gateway::{
        ReconnectType, Shard, ShardManager, ShardManagerOptions, ShardMessenger,
    };
    use crate::model::gateway::ShardInfo;
    use crate::model::id::{ChannelId, GuildId, ShardId, UserId};
    use crate::voice::{VoiceError, VoiceManager};
    use crate::Error;

    fn runner(voice: Option<Arc<VoiceManager>>) -> ShardRunner {
        let (event_tx, _event_rx) = tokio::sync::mpsc::unbounded_channel::<ClientEvent>();

        let manager = ShardManager::new(ShardManagerOptions {
            token: SecretString::new("Bot example".to_string()),
            shard_total: 1,
            ws_url: Arc::from("wss://gateway.example"),
            event_tx: event_tx.clone(),
            cache: Arc::new(Cache::default()),
            voice: voice.clone(),
            presence: None,
        });

        ShardRunner::new(ShardRunnerOptions {
            shard: Shard::new(ShardInfo::new(ShardId(0), 1), None),
            manager,
            cache: Arc::new(Cache::default()),
            event_tx,
            voice,
            token: SecretString::new("Bot example".to_string()),
            ws_url: Arc::from("wss://gateway.example"),
            identify_bucket: Arc::new(TokenBucket::new(1, Duration::from_secs(5))),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn a_presence_flood_never_parks_the_runner() {
        let mut runner = runner(None);

        // Well past the throttle's limit; the excess must coalesce, not wait
        // out the refill window.
        let start = Instant::now();
        for _ in 0..10 {
            assert!(runner.handle_message(ShardRunnerMessage::SetActivity(None)).await);
        }

        assert_eq!(start.elapsed(), Duration::ZERO);
        assert!(runner.presence_pending);
    }

    #[tokio::test]
    async fn a_dropped_connection_counts_toward_backoff() {
        let mut runner = runner(None);

        runner.begin_reconnect(ReconnectType::Resume).await;
        runner.begin_reconnect(ReconnectType::Resume).await;

        assert_eq!(runner.reconnect_attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_invalidates_the_shard_voice_sessions() {
        let (event_tx, _event_rx) = tokio::sync::mpsc::unbounded_channel::<ClientEvent>();
        let voice = VoiceManager::new(event_tx);
        let mut runner = runner(Some(Arc::clone(&voice)));

        voice.set_user_id(UserId::new(1));
        voice.register_shard(ShardId(0), 1, ShardMessenger::from_tx(runner.runner_tx()));

        assert!(!runner.handle_message(ShardRunnerMessage::Shutdown(1000)).await);

        // The shard's messenger is gone from the registry, so the next join
        // has nothing to ride on.
        let err = voice.join(GuildId::new(1), ChannelId::new(2)).await.unwrap_err();
        assert!(matches!(err, Error::Voice(VoiceError::NoShard)));
    }
}
