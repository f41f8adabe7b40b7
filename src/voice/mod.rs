//! Voice sessions negotiated over the primary gateway.
//!
//! The [`VoiceManager`] is the registry: it routes join/leave requests over
//! the right shard, relays the session/server credentials the gateway sends
//! back, and tears connections down when the shard session carrying them is
//! lost. Each [`VoiceConnection`] then runs its own signaling channel.

mod broadcast;
mod connection;
mod error;

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

pub use self::broadcast::SharedStream;
pub use self::connection::{AudioResource, VoiceConnection, VoiceConnectionStage};
pub use self::error::Error as VoiceError;
use crate::client::ClientEvent;
use crate::gateway::ShardMessenger;
use crate::model::id::{ChannelId, GuildId, ShardId, UserId};
use crate::model::voice::{VoiceServerUpdateEvent, VoiceState};
use crate::{Error, Result};

/// The registry of voice connections, one per guild at most.
#[derive(Debug)]
pub struct VoiceManager {
    connections: DashMap<GuildId, Arc<VoiceConnection>>,
    shards: DashMap<ShardId, ShardMessenger>,
    /// Zero until the first shard reports Ready.
    shard_total: AtomicU16,
    user_id: Mutex<Option<UserId>>,
    event_tx: tokio::sync::mpsc::UnboundedSender<ClientEvent>,
}

impl VoiceManager {
    #[must_use]
    pub fn new(event_tx: tokio::sync::mpsc::UnboundedSender<ClientEvent>) -> Arc<Self> {
        Arc::new(Self {
            connections: DashMap::new(),
            shards: DashMap::new(),
            shard_total: AtomicU16::new(0),
            user_id: Mutex::new(None),
            event_tx,
        })
    }

    /// Joins (or moves to) a voice channel, returning the guild's connection.
    ///
    /// A first join sends the voice-state update over the owning shard, waits
    /// for the gateway to relay session credentials, and opens the signaling
    /// channel. A join while already connected in the guild switches channel
    /// on the existing session without a teardown.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::NoShard`] before the owning shard is ready, and
    /// [`VoiceError::ConnectionTimeout`] when the credentials never arrive.
    pub async fn join(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> Result<Arc<VoiceConnection>> {
        let messenger = self.messenger_for(guild_id)?;

        if let Some(connection) = self.connections.get(&guild_id).map(|c| Arc::clone(&c)) {
            debug!("Switching voice channel in {guild_id} to {channel_id}");

            connection.set_channel(channel_id);
            messenger.update_voice_state(guild_id, Some(channel_id), false, false);
            return Ok(connection);
        }

        let user_id = self.user_id.lock().ok_or(Error::Voice(VoiceError::NoShard))?;

        info!("Joining voice channel {channel_id} in {guild_id}");

        let connection = VoiceConnection::new(guild_id, user_id, channel_id);
        self.connections.insert(guild_id, Arc::clone(&connection));
        messenger.update_voice_state(guild_id, Some(channel_id), false, false);

        match connection.connect().await {
            Ok(()) => Ok(connection),
            Err(why) => {
                self.connections.remove(&guild_id);
                messenger.update_voice_state(guild_id, None, false, false);
                Err(why)
            },
        }
    }

    /// Leaves the guild's voice channel, destroying its connection.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::NoShard`] before the owning shard is ready, and
    /// [`VoiceError::NotConnected`] when the guild has no connection to
    /// leave.
    pub async fn leave(&self, guild_id: GuildId) -> Result<()> {
        let messenger = self.messenger_for(guild_id)?;

        let Some((_, connection)) = self.connections.remove(&guild_id) else {
            return Err(Error::Voice(VoiceError::NotConnected));
        };

        info!("Leaving voice in {guild_id}");

        messenger.update_voice_state(guild_id, None, false, false);
        connection.invalidate();
        drop(self.event_tx.send(ClientEvent::VoiceDisconnect { guild_id }));

        Ok(())
    }

    /// The guild's voice connection, if one exists.
    #[must_use]
    pub fn get(&self, guild_id: GuildId) -> Option<Arc<VoiceConnection>> {
        self.connections.get(&guild_id).map(|c| Arc::clone(&c))
    }

    pub(crate) fn set_user_id(&self, user_id: UserId) {
        *self.user_id.lock() = Some(user_id);
    }

    /// Registers a shard's messenger once it is ready to carry voice-state
    /// updates.
    pub(crate) fn register_shard(&self, shard_id: ShardId, total: u16, messenger: ShardMessenger) {
        self.shard_total.store(total, Ordering::SeqCst);
        self.shards.insert(shard_id, messenger);
    }

    /// Invalidates every connection riding on the shard's session. Called
    /// when the shard loses its session; the connections cannot survive it.
    pub(crate) fn deregister_shard(&self, shard_id: ShardId) {
        self.shards.remove(&shard_id);

        let total = self.shard_total.load(Ordering::SeqCst);
        if total == 0 {
            return;
        }

        let orphaned: Vec<GuildId> = self
            .connections
            .iter()
            .map(|entry| *entry.key())
            .filter(|guild_id| shard_for(*guild_id, total) == shard_id)
            .collect();

        for guild_id in orphaned {
            warn!("Voice connection in {guild_id} lost its shard session");

            if let Some((_, connection)) = self.connections.remove(&guild_id) {
                connection.invalidate();
                drop(self.event_tx.send(ClientEvent::VoiceDisconnect { guild_id }));
            }
        }
    }

    /// Relays our own voice-state updates into the matching connection.
    pub(crate) fn state_update(&self, state: &VoiceState) {
        let ours = self.user_id.lock().is_some_and(|id| id == state.user_id);
        if !ours {
            return;
        }

        let Some(guild_id) = state.guild_id else { return };
        let Some(connection) = self.get(guild_id) else { return };

        match state.channel_id {
            Some(channel_id) => {
                connection.set_channel(channel_id);
                connection.set_session(state.session_id.clone());
            },
            None => {
                // The service moved us out of voice; the session is gone.
                if let Some((_, connection)) = self.connections.remove(&guild_id) {
                    connection.invalidate();
                    drop(self.event_tx.send(ClientEvent::VoiceDisconnect { guild_id }));
                }
            },
        }
    }

    /// Relays server credentials into the matching connection. An update
    /// without an endpoint means the server is reallocating; the connection
    /// keeps waiting for one that carries it.
    pub(crate) fn server_update(&self, update: &VoiceServerUpdateEvent) {
        let Some(connection) = self.get(update.guild_id) else { return };

        if let Some(endpoint) = &update.endpoint {
            connection.set_server(update.token.clone(), endpoint.clone());
        } else {
            debug!("Voice server for {} reallocating; waiting for an endpoint", update.guild_id);
        }
    }

    fn messenger_for(&self, guild_id: GuildId) -> Result<ShardMessenger> {
        let total = self.shard_total.load(Ordering::SeqCst);
        if total == 0 {
            return Err(Error::Voice(VoiceError::NoShard));
        }

        self.shards
            .get(&shard_for(guild_id, total))
            .map(|m| m.clone())
            .ok_or(Error::Voice(VoiceError::NoShard))
    }
}

fn shard_for(guild_id: GuildId, total: u16) -> ShardId {
    ShardId((guild_id.get() % u64::from(total)) as u16)
}
