//! An in-memory store of entities received over the gateway.
//!
//! The cache is populated passively as dispatch events arrive; it never
//! fetches. Guild-scoped collections (members, voice states) are partitioned
//! per guild so that a guild's removal drops its dependents in one motion.

mod store;

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;

pub use self::store::{CacheEntity, Resident, Store};
use crate::model::channel::{Channel, Message};
use crate::model::guild::{Guild, Member, Role};
use crate::model::id::{ChannelId, GuildId, MessageId, RoleId, UserId};
use crate::model::user::User;
use crate::model::voice::VoiceState;

/// Knobs for cache retention.
#[derive(Clone, Copy, Debug)]
#[non_exhaustive]
pub struct Settings {
    /// How many messages to retain per process, oldest evicted first.
    pub max_messages: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self { max_messages: 100 }
    }
}

/// The shared entity cache.
///
/// Interior locks are held only for the duration of each method; accessors
/// return clones or [`Resident`] handles, never guards.
#[derive(Debug)]
#[non_exhaustive]
pub struct Cache {
    pub(crate) guilds: RwLock<Store<Guild>>,
    pub(crate) channels: RwLock<Store<Channel>>,
    pub(crate) users: RwLock<Store<User>>,
    pub(crate) messages: RwLock<Store<Message>>,
    pub(crate) roles: RwLock<Store<Role>>,
    pub(crate) members: RwLock<HashMap<GuildId, Store<Member>>>,
    pub(crate) voice_states: RwLock<HashMap<GuildId, Store<VoiceState>>>,
    pub(crate) unavailable_guilds: RwLock<HashSet<GuildId>>,
}

impl Cache {
    #[must_use]
    pub fn new(settings: Settings) -> Self {
        Self {
            guilds: RwLock::new(Store::new()),
            channels: RwLock::new(Store::new()),
            users: RwLock::new(Store::new()),
            messages: RwLock::new(Store::bounded(settings.max_messages)),
            roles: RwLock::new(Store::new()),
            members: RwLock::new(HashMap::new()),
            voice_states: RwLock::new(HashMap::new()),
            unavailable_guilds: RwLock::new(HashSet::new()),
        }
    }

    pub fn guild(&self, id: GuildId) -> Option<Guild> {
        self.guilds.read().get_cloned(&id)
    }

    pub fn channel(&self, id: ChannelId) -> Option<Channel> {
        self.channels.read().get_cloned(&id)
    }

    pub fn user(&self, id: UserId) -> Option<User> {
        self.users.read().get_cloned(&id)
    }

    pub fn message(&self, id: MessageId) -> Option<Message> {
        self.messages.read().get_cloned(&id)
    }

    pub fn role(&self, id: RoleId) -> Option<Role> {
        self.roles.read().get_cloned(&id)
    }

    pub fn member(&self, guild_id: GuildId, user_id: UserId) -> Option<Member> {
        self.members.read().get(&guild_id)?.get_cloned(&user_id)
    }

    pub fn voice_state(&self, guild_id: GuildId, user_id: UserId) -> Option<VoiceState> {
        self.voice_states.read().get(&guild_id)?.get_cloned(&user_id)
    }

    /// Whether the guild is known but currently flagged unavailable.
    pub fn is_guild_unavailable(&self, id: GuildId) -> bool {
        self.unavailable_guilds.read().contains(&id)
    }

    pub fn guild_count(&self) -> usize {
        self.guilds.read().len()
    }

    pub fn user_count(&self) -> usize {
        self.users.read().len()
    }

    pub fn message_count(&self) -> usize {
        self.messages.read().len()
    }

    /// Every cached channel of the given guild.
    pub fn guild_channels(&self, guild_id: GuildId) -> Vec<Channel> {
        self.channels.read().filter(|c| c.guild_id() == Some(guild_id))
    }

    /// Every cached role of the given guild.
    pub fn guild_roles(&self, guild_id: GuildId) -> Vec<Role> {
        self.roles.read().filter(|r| r.guild_id == guild_id)
    }

    /// Drops a guild and every guild-scoped dependent, returning the guild if
    /// it was cached.
    pub(crate) fn forget_guild(&self, id: GuildId) -> Option<Guild> {
        let removed = self.guilds.write().remove(&id).map(|g| g.read().clone());

        self.members.write().remove(&id);
        self.voice_states.write().remove(&id);

        let channel_ids: Vec<ChannelId> = self
            .channels
            .read()
            .filter(|c| c.guild_id() == Some(id))
            .into_iter()
            .map(|c| c.id())
            .collect();
        {
            let mut channels = self.channels.write();
            for channel_id in channel_ids {
                channels.remove(&channel_id);
            }
        }

        let role_ids: Vec<RoleId> = self
            .roles
            .read()
            .filter(|r| r.guild_id == id)
            .into_iter()
            .map(|r| r.id)
            .collect();
        {
            let mut roles = self.roles.write();
            for role_id in role_ids {
                roles.remove(&role_id);
            }
        }

        removed
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self::new(Settings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::{Cache, Settings};
    use crate::model::channel::Message;
    use crate::model::id::{ChannelId, GuildId, MessageId, UserId};
    use crate::model::user::User;

    fn message(id: u64) -> Message {
        Message {
            id: MessageId::new(id),
            channel_id: ChannelId::new(1),
            guild_id: None,
            author: User::stand_in(UserId::new(2)),
            content: format!("m{id}"),
            timestamp: None,
            edited_timestamp: None,
            pinned: false,
        }
    }

    #[test]
    fn message_store_honours_the_configured_bound() {
        let cache = Cache::new(Settings { max_messages: 2 });
        for id in 1..=5u64 {
            cache.messages.write().insert(message(id), false);
        }

        assert_eq!(cache.message_count(), 2);
        assert!(cache.message(MessageId::new(3)).is_none());
        assert!(cache.message(MessageId::new(5)).is_some());
    }

    #[test]
    fn forget_guild_drops_dependents() {
        let cache = Cache::default();
        let guild_id = GuildId::new(9);

        let channel: crate::model::channel::Channel =
            serde_json::from_str(r#"{"id":"10","type":0,"guild_id":"9","name":"general"}"#)
                .unwrap();
        cache.channels.write().insert(channel, false);
        cache
            .members
            .write()
            .entry(guild_id)
            .or_default()
            .insert(
                crate::model::guild::Member {
                    guild_id,
                    user: User::stand_in(UserId::new(2)),
                    nick: None,
                    roles: Vec::new(),
                    joined_at: None,
                    mute: false,
                    deaf: false,
                },
                false,
            );

        cache.forget_guild(guild_id);

        assert!(cache.channel(ChannelId::new(10)).is_none());
        assert!(cache.member(guild_id, UserId::new(2)).is_none());
    }
}
