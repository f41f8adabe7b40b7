use serde::Deserialize;

use crate::cache::CacheEntity;
use crate::model::id::{GuildId, RoleId, UserId};
use crate::model::user::User;

/// A guild with full data available, built up from the gateway.
///
/// Channels, members and roles live in their own cache stores and reference
/// the guild by id; the guild does not embed them.
#[derive(Clone, Debug, Deserialize)]
#[non_exhaustive]
pub struct Guild {
    pub id: GuildId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub owner_id: Option<UserId>,
    /// Whether the guild exceeds the large threshold, in which case its
    /// member list arrives in chunks rather than inline.
    #[serde(default)]
    pub large: bool,
    #[serde(default)]
    pub member_count: u64,
    #[serde(default)]
    pub unavailable: bool,
}

impl CacheEntity for Guild {
    type Id = GuildId;

    fn entity_id(&self) -> GuildId {
        self.id
    }

    fn merge(&mut self, newer: Self) {
        self.name = newer.name;
        self.icon = newer.icon;
        if newer.owner_id.is_some() {
            self.owner_id = newer.owner_id;
        }
        // Update payloads omit gateway-only bookkeeping; keep what we have.
        if newer.member_count != 0 {
            self.member_count = newer.member_count;
            self.large = newer.large;
        }
        self.unavailable = newer.unavailable;
    }
}

/// A guild the gateway has announced but not yet (or no longer) delivered.
///
/// Also the stand-in emitted when a delete arrives for an uncached guild.
#[derive(Clone, Debug, Deserialize)]
#[non_exhaustive]
pub struct UnavailableGuild {
    pub id: GuildId,
    #[serde(default)]
    pub unavailable: bool,
}

/// A role belonging to a guild, referenced from members by id.
#[derive(Clone, Debug, Deserialize)]
#[non_exhaustive]
pub struct Role {
    pub id: RoleId,
    /// Filled in during dispatch; role payloads arrive wrapped in an event
    /// carrying the guild id separately.
    #[serde(default)]
    pub guild_id: GuildId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub position: i64,
}

impl CacheEntity for Role {
    type Id = RoleId;

    fn entity_id(&self) -> RoleId {
        self.id
    }

    fn merge(&mut self, newer: Self) {
        if newer.guild_id != GuildId::default() {
            self.guild_id = newer.guild_id;
        }
        self.name = newer.name;
        self.position = newer.position;
    }
}

/// A user's state within one guild.
///
/// The member embeds its wire-delivered [`User`] (which dispatch also feeds
/// into the shared user store) and references roles by id only.
#[derive(Clone, Debug, Deserialize)]
#[non_exhaustive]
pub struct Member {
    #[serde(default)]
    pub guild_id: GuildId,
    pub user: User,
    #[serde(default)]
    pub nick: Option<String>,
    #[serde(default)]
    pub roles: Vec<RoleId>,
    #[serde(default)]
    pub joined_at: Option<String>,
    #[serde(default)]
    pub mute: bool,
    #[serde(default)]
    pub deaf: bool,
}

impl CacheEntity for Member {
    type Id = UserId;

    fn entity_id(&self) -> UserId {
        self.user.id
    }

    fn merge(&mut self, newer: Self) {
        self.user.merge(newer.user);
        self.nick = newer.nick;
        self.roles = newer.roles;
        if newer.joined_at.is_some() {
            self.joined_at = newer.joined_at;
        }
        self.mute = newer.mute;
        self.deaf = newer.deaf;
    }
}

#[cfg(test)]
mod tests {
    use super::{Guild, Member};
    use crate::cache::CacheEntity;

    #[test]
    fn guild_merge_keeps_gateway_bookkeeping() {
        let mut guild: Guild = serde_json::from_str(
            r#"{"id":"1","name":"old","large":true,"member_count":9000}"#,
        )
        .unwrap();
        let update: Guild = serde_json::from_str(r#"{"id":"1","name":"new"}"#).unwrap();

        guild.merge(update);
        assert_eq!(guild.name, "new");
        assert!(guild.large);
        assert_eq!(guild.member_count, 9000);
    }

    #[test]
    fn member_references_roles_by_id() {
        let member: Member = serde_json::from_str(
            r#"{"user":{"id":"2","username":"someone"},"roles":["5","6"]}"#,
        )
        .unwrap();
        assert_eq!(member.roles.len(), 2);
        assert_eq!(member.roles[0].get(), 5);
    }
}
