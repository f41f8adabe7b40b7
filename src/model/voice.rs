//! Models pertaining to voice sessions.

use serde::Deserialize;

use crate::cache::CacheEntity;
use crate::model::id::{ChannelId, GuildId, UserId};

/// A user's voice state within a guild.
#[derive(Clone, Debug, Deserialize)]
#[non_exhaustive]
pub struct VoiceState {
    #[serde(default)]
    pub guild_id: Option<GuildId>,
    /// `None` means the user left voice entirely.
    #[serde(default)]
    pub channel_id: Option<ChannelId>,
    pub user_id: UserId,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub self_mute: bool,
    #[serde(default)]
    pub self_deaf: bool,
}

impl CacheEntity for VoiceState {
    type Id = UserId;

    fn entity_id(&self) -> UserId {
        self.user_id
    }

    fn merge(&mut self, newer: Self) {
        *self = newer;
    }
}

/// Credentials for a guild's voice server, relayed over the primary gateway
/// after a voice-state update requests a join.
#[derive(Clone, Debug, Deserialize)]
#[non_exhaustive]
pub struct VoiceServerUpdateEvent {
    pub guild_id: GuildId,
    pub token: String,
    /// Absent while the voice server is reallocating; a connection must wait
    /// for an update carrying one.
    #[serde(default)]
    pub endpoint: Option<String>,
}
