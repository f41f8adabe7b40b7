use futures::channel::mpsc::UnboundedSender as Sender;
use tokio_tungstenite::tungstenite::Message;
use tracing::warn;

use super::{ChunkGuildFilter, ShardRunner, ShardRunnerMessage};
use crate::model::gateway::{ActivityData, OnlineStatus};
use crate::model::id::{ChannelId, GuildId, UserId};

/// A lightweight handle for sending messages to a [`ShardRunner`].
///
/// Cheap to clone; every clone feeds the same runner. Sends are
/// fire-and-forget: a runner that has stopped simply drops them, with a
/// warning.
#[derive(Clone, Debug)]
pub struct ShardMessenger {
    tx: Sender<ShardRunnerMessage>,
}

impl ShardMessenger {
    #[must_use]
    pub fn new(runner: &ShardRunner) -> Self {
        Self {
            tx: runner.runner_tx(),
        }
    }

    pub(crate) fn from_tx(tx: Sender<ShardRunnerMessage>) -> Self {
        Self {
            tx,
        }
    }

    /// Requests that one of a guild's member chunks be sent to the shard.
    ///
    /// With a `filter` of [`ChunkGuildFilter::None`] and no `limit`, the full
    /// member list is chunked over.
    pub fn chunk_guild(
        &self,
        guild_id: GuildId,
        limit: Option<u16>,
        filter: ChunkGuildFilter,
        nonce: Option<String>,
    ) {
        self.send_to_shard(ShardRunnerMessage::ChunkGuild {
            guild_id,
            limit,
            filter,
            nonce,
        });
    }

    /// Sets the activity shown in the bot's presence, leaving the status
    /// untouched.
    pub fn set_activity(&self, activity: Option<ActivityData>) {
        self.send_to_shard(ShardRunnerMessage::SetActivity(activity));
    }

    pub fn set_presence(&self, activity: Option<ActivityData>, status: OnlineStatus) {
        self.send_to_shard(ShardRunnerMessage::SetPresence(activity, status));
    }

    /// Sets the online status of the bot. [`OnlineStatus::Offline`] is not
    /// sendable and becomes [`OnlineStatus::Invisible`].
    pub fn set_status(&self, status: OnlineStatus) {
        self.send_to_shard(ShardRunnerMessage::SetStatus(status));
    }

    /// Joins, moves within, or (with a `channel_id` of `None`) leaves a
    /// guild's voice channels.
    pub fn update_voice_state(
        &self,
        guild_id: GuildId,
        channel_id: Option<ChannelId>,
        self_mute: bool,
        self_deaf: bool,
    ) {
        self.send_to_shard(ShardRunnerMessage::UpdateVoiceState {
            guild_id,
            channel_id,
            self_mute,
            self_deaf,
        });
    }

    /// Requests that a member's user ids matching a query be looked up.
    pub fn search_members(&self, guild_id: GuildId, query: String, limit: Option<u16>) {
        self.chunk_guild(guild_id, limit, ChunkGuildFilter::Query(query), None);
    }

    /// Requests chunks for a specific set of users.
    pub fn request_members(&self, guild_id: GuildId, user_ids: Vec<UserId>) {
        self.chunk_guild(guild_id, None, ChunkGuildFilter::UserIds(user_ids), None);
    }

    /// Closes the session cleanly and stops the runner.
    pub fn shutdown_clean(&self) {
        self.send_to_shard(ShardRunnerMessage::Shutdown(1000));
    }

    /// Drops the session and reconnects with a fresh identify.
    pub fn restart(&self) {
        self.send_to_shard(ShardRunnerMessage::Restart);
    }

    /// Sends a raw websocket message, unmodified.
    pub fn websocket_message(&self, message: Message) {
        self.send_to_shard(ShardRunnerMessage::Message(message));
    }

    pub fn send_to_shard(&self, msg: ShardRunnerMessage) {
        if let Err(why) = self.tx.unbounded_send(msg) {
            warn!("Failed to send to shard: {why:?}");
        }
    }
}
