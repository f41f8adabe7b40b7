use serde::{Deserialize, Deserializer};

use crate::cache::CacheEntity;
use crate::model::id::{ChannelId, GuildId, MessageId, UserId};
use crate::model::user::User;

/// A channel of any kind.
///
/// The service models channels as one type hierarchy; here each concrete
/// kind is a tagged variant, with capability checks (`is_messageable`,
/// `is_voice`) instead of downcasts.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum Channel {
    Text(TextChannel),
    Voice(VoiceChannel),
    Category(CategoryChannel),
    Private(PrivateChannel),
    Group(GroupChannel),
}

impl Channel {
    #[must_use]
    pub fn id(&self) -> ChannelId {
        match self {
            Self::Text(c) => c.id,
            Self::Voice(c) => c.id,
            Self::Category(c) => c.id,
            Self::Private(c) => c.id,
            Self::Group(c) => c.id,
        }
    }

    /// The guild owning the channel, if it is a guild channel.
    #[must_use]
    pub fn guild_id(&self) -> Option<GuildId> {
        match self {
            Self::Text(c) => Some(c.guild_id),
            Self::Voice(c) => Some(c.guild_id),
            Self::Category(c) => Some(c.guild_id),
            Self::Private(_) | Self::Group(_) => None,
        }
    }

    /// Whether messages can be sent to the channel.
    #[must_use]
    pub fn is_messageable(&self) -> bool {
        matches!(self, Self::Text(_) | Self::Private(_) | Self::Group(_))
    }

    /// Whether the channel can host a voice session.
    #[must_use]
    pub fn is_voice(&self) -> bool {
        matches!(self, Self::Voice(_))
    }

    #[must_use]
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Text(c) => Some(&c.name),
            Self::Voice(c) => Some(&c.name),
            Self::Category(c) => Some(&c.name),
            Self::Group(c) => c.name.as_deref(),
            Self::Private(_) => None,
        }
    }
}

impl CacheEntity for Channel {
    type Id = ChannelId;

    fn entity_id(&self) -> ChannelId {
        self.id()
    }

    fn merge(&mut self, newer: Self) {
        // Channel updates ship the full object; a field-wise merge would be
        // identical to assignment.
        *self = newer;
    }
}

#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct TextChannel {
    pub id: ChannelId,
    pub guild_id: GuildId,
    pub name: String,
    pub topic: Option<String>,
    pub position: i64,
}

#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct VoiceChannel {
    pub id: ChannelId,
    pub guild_id: GuildId,
    pub name: String,
    pub position: i64,
    pub user_limit: Option<u64>,
}

#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct CategoryChannel {
    pub id: ChannelId,
    pub guild_id: GuildId,
    pub name: String,
    pub position: i64,
}

#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct PrivateChannel {
    pub id: ChannelId,
    pub recipient: Option<User>,
}

#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct GroupChannel {
    pub id: ChannelId,
    pub name: Option<String>,
    pub recipients: Vec<User>,
    pub owner_id: Option<UserId>,
}

// Wire channels are discriminated by an integer `type` field, so the enum is
// built by hand from a raw mirror rather than via derive.
#[derive(Deserialize)]
struct RawChannel {
    id: ChannelId,
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default)]
    guild_id: Option<GuildId>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    topic: Option<String>,
    #[serde(default)]
    position: i64,
    #[serde(default)]
    user_limit: Option<u64>,
    #[serde(default)]
    recipients: Vec<User>,
    #[serde(default)]
    owner_id: Option<UserId>,
}

const KIND_TEXT: u8 = 0;
const KIND_PRIVATE: u8 = 1;
const KIND_VOICE: u8 = 2;
const KIND_GROUP: u8 = 3;
const KIND_CATEGORY: u8 = 4;
const KIND_NEWS: u8 = 5;

impl<'de> Deserialize<'de> for Channel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawChannel::deserialize(deserializer)?;
        let guild_id = raw.guild_id.unwrap_or_default();
        let name = raw.name.clone().unwrap_or_default();

        Ok(match raw.kind {
            KIND_TEXT | KIND_NEWS => Self::Text(TextChannel {
                id: raw.id,
                guild_id,
                name,
                topic: raw.topic,
                position: raw.position,
            }),
            KIND_VOICE => Self::Voice(VoiceChannel {
                id: raw.id,
                guild_id,
                name,
                position: raw.position,
                user_limit: raw.user_limit,
            }),
            KIND_CATEGORY => Self::Category(CategoryChannel {
                id: raw.id,
                guild_id,
                name,
                position: raw.position,
            }),
            KIND_PRIVATE => Self::Private(PrivateChannel {
                id: raw.id,
                recipient: raw.recipients.into_iter().next(),
            }),
            KIND_GROUP => Self::Group(GroupChannel {
                id: raw.id,
                name: raw.name,
                recipients: raw.recipients,
                owner_id: raw.owner_id,
            }),
            other => {
                return Err(serde::de::Error::custom(format_args!(
                    "unknown channel kind: {other}"
                )))
            },
        })
    }
}

/// A message sent in a messageable channel.
#[derive(Clone, Debug, Deserialize)]
#[non_exhaustive]
pub struct Message {
    pub id: MessageId,
    pub channel_id: ChannelId,
    #[serde(default)]
    pub guild_id: Option<GuildId>,
    pub author: User,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub edited_timestamp: Option<String>,
    #[serde(default)]
    pub pinned: bool,
}

impl CacheEntity for Message {
    type Id = MessageId;

    fn entity_id(&self) -> MessageId {
        self.id
    }

    fn merge(&mut self, newer: Self) {
        self.content = newer.content;
        self.edited_timestamp = newer.edited_timestamp;
        self.pinned = newer.pinned;
    }
}
