//! Models pertaining to the gateway handshake and presence.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::guild::UnavailableGuild;
use crate::model::id::{GuildId, ShardId, UserId};
use crate::model::user::User;

/// The payload of the ready acknowledgment that completes an identify.
#[derive(Clone, Debug, Deserialize)]
#[non_exhaustive]
pub struct Ready {
    #[serde(rename = "v", default)]
    pub version: u8,
    pub user: User,
    pub session_id: String,
    /// Where to reconnect for resumes, when the service provides one.
    #[serde(default)]
    pub resume_gateway_url: Option<String>,
    #[serde(default)]
    pub guilds: Vec<UnavailableGuild>,
    #[serde(default)]
    pub shard: Option<[u16; 2]>,
}

/// Which shard a connection is, out of how many.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ShardInfo {
    pub id: ShardId,
    pub total: u16,
}

impl ShardInfo {
    #[must_use]
    pub fn new(id: ShardId, total: u16) -> Self {
        assert!(total > 0, "shard total must be non-zero");
        Self { id, total }
    }
}

impl fmt::Display for ShardInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}/{}]", self.id, self.total)
    }
}

/// The online status a client shows as.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum OnlineStatus {
    #[serde(rename = "dnd")]
    DoNotDisturb,
    Idle,
    Invisible,
    Offline,
    #[default]
    Online,
}

impl OnlineStatus {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::DoNotDisturb => "dnd",
            Self::Idle => "idle",
            Self::Invisible => "invisible",
            Self::Offline => "offline",
            Self::Online => "online",
        }
    }
}

/// An activity shown in a presence.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[non_exhaustive]
pub struct ActivityData {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: u8,
    #[serde(default)]
    pub url: Option<String>,
}

impl ActivityData {
    /// An activity shown as "Playing `name`".
    #[must_use]
    pub fn playing(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: 0,
            url: None,
        }
    }
}

/// The presence sent with identifies and presence updates.
#[derive(Clone, Debug, Default)]
pub struct PresenceData {
    pub activity: Option<ActivityData>,
    pub status: OnlineStatus,
}

/// A user's presence, as delivered by presence update events.
#[derive(Clone, Debug, Deserialize)]
#[non_exhaustive]
pub struct Presence {
    pub user: PresenceUser,
    #[serde(default)]
    pub guild_id: Option<GuildId>,
    #[serde(default)]
    pub status: OnlineStatus,
}

/// The partial user attached to a presence; only the id is guaranteed.
#[derive(Clone, Debug, Deserialize)]
pub struct PresenceUser {
    pub id: UserId,
}

/// The REST-delivered gateway bootstrap payload.
#[derive(Clone, Debug, Deserialize)]
#[non_exhaustive]
pub struct Gateway {
    pub url: String,
    #[serde(default)]
    pub shards: Option<u16>,
}
