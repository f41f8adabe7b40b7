//! Request routes and their ratelimit grouping.
//!
//! Two requests share a ratelimit bucket when they hit the same kind of
//! endpoint through the same major parameter (the channel or guild id).
//! Minor parameters do not split buckets: `/channels/4/messages/10` and
//! `/channels/4/messages/11` are limited together, while
//! `/channels/5/messages/10` is limited separately.

use std::borrow::Cow;

use crate::model::id::{ChannelId, GuildId, MessageId, UserId};

/// A REST endpoint, carrying the parameters needed to build its path.
#[derive(Clone, Copy, Debug)]
pub enum Route {
    Channel { channel_id: ChannelId },
    ChannelMessages { channel_id: ChannelId },
    ChannelMessage { channel_id: ChannelId, message_id: MessageId },
    Gateway,
    GatewayBot,
    Guild { guild_id: GuildId },
    GuildChannels { guild_id: GuildId },
    GuildMember { guild_id: GuildId, user_id: UserId },
    GuildMembers { guild_id: GuildId },
    User { user_id: UserId },
    CurrentUser,
}

/// The key grouping requests for ratelimiting: the endpoint kind plus its
/// major parameter, if it has one. `None` marks routes exempt from
/// per-route ratelimiting entirely.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct RatelimitingBucket(Option<(RouteKind, Option<u64>)>);

impl RatelimitingBucket {
    #[must_use]
    pub fn is_none(&self) -> bool {
        self.0.is_none()
    }
}

/// The endpoint kind, with parameters erased.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
enum RouteKind {
    Channel,
    ChannelMessages,
    ChannelMessage,
    Gateway,
    GatewayBot,
    Guild,
    GuildChannels,
    GuildMember,
    GuildMembers,
    User,
    CurrentUser,
}

impl Route {
    /// The request path, relative to the API base (or a proxy standing in
    /// for it).
    #[must_use]
    pub fn path(self) -> Cow<'static, str> {
        match self {
            Self::Channel { channel_id } => Cow::Owned(format!("/channels/{channel_id}")),
            Self::ChannelMessages { channel_id } => {
                Cow::Owned(format!("/channels/{channel_id}/messages"))
            },
            Self::ChannelMessage { channel_id, message_id } => {
                Cow::Owned(format!("/channels/{channel_id}/messages/{message_id}"))
            },
            Self::Gateway => Cow::Borrowed("/gateway"),
            Self::GatewayBot => Cow::Borrowed("/gateway/bot"),
            Self::Guild { guild_id } => Cow::Owned(format!("/guilds/{guild_id}")),
            Self::GuildChannels { guild_id } => Cow::Owned(format!("/guilds/{guild_id}/channels")),
            Self::GuildMember { guild_id, user_id } => {
                Cow::Owned(format!("/guilds/{guild_id}/members/{user_id}"))
            },
            Self::GuildMembers { guild_id } => Cow::Owned(format!("/guilds/{guild_id}/members")),
            Self::User { user_id } => Cow::Owned(format!("/users/{user_id}")),
            Self::CurrentUser => Cow::Borrowed("/users/@me"),
        }
    }

    /// The ratelimit grouping key: endpoint kind plus major parameter. The
    /// message id on [`Route::ChannelMessage`] is a minor parameter and does
    /// not appear in the key.
    #[must_use]
    pub fn ratelimiting_bucket(&self) -> RatelimitingBucket {
        let (kind, major) = match *self {
            Self::Channel { channel_id } => (RouteKind::Channel, Some(channel_id.get())),
            Self::ChannelMessages { channel_id } => {
                (RouteKind::ChannelMessages, Some(channel_id.get()))
            },
            Self::ChannelMessage { channel_id, .. } => {
                (RouteKind::ChannelMessage, Some(channel_id.get()))
            },
            Self::Gateway => (RouteKind::Gateway, None),
            Self::GatewayBot => (RouteKind::GatewayBot, None),
            Self::Guild { guild_id } => (RouteKind::Guild, Some(guild_id.get())),
            Self::GuildChannels { guild_id } => (RouteKind::GuildChannels, Some(guild_id.get())),
            Self::GuildMember { guild_id, .. } => (RouteKind::GuildMember, Some(guild_id.get())),
            Self::GuildMembers { guild_id } => (RouteKind::GuildMembers, Some(guild_id.get())),
            Self::User { .. } => (RouteKind::User, None),
            Self::CurrentUser => (RouteKind::CurrentUser, None),
        };

        RatelimitingBucket(Some((kind, major)))
    }
}

#[cfg(test)]
mod tests {
    use super::Route;
    use crate::model::id::{ChannelId, MessageId};

    #[test]
    fn major_parameter_distinguishes_buckets() {
        let a = Route::ChannelMessages {
            channel_id: ChannelId::new(4),
        };
        let b = Route::ChannelMessages {
            channel_id: ChannelId::new(5),
        };
        assert_ne!(a.ratelimiting_bucket(), b.ratelimiting_bucket());
    }

    #[test]
    fn minor_parameter_does_not_distinguish_buckets() {
        let a = Route::ChannelMessage {
            channel_id: ChannelId::new(10),
            message_id: MessageId::new(11),
        };
        let b = Route::ChannelMessage {
            channel_id: ChannelId::new(10),
            message_id: MessageId::new(12),
        };
        assert_eq!(a.ratelimiting_bucket(), b.ratelimiting_bucket());
        assert_ne!(a.path(), b.path());
    }

    #[test]
    fn paths_interpolate_major_parameters() {
        assert_eq!(Route::GatewayBot.path(), "/gateway/bot");
        assert_eq!(Route::Channel { channel_id: ChannelId::new(7) }.path(), "/channels/7");
    }
}
