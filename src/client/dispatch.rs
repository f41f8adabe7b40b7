//! Applies dispatch events to the cache and shapes them for the consumer.
//!
//! Snapshots of overwritten state are taken before mutating, so `old` values
//! in the resulting [`ClientEvent`] reflect what a consumer saw previously.

use tracing::debug;

use super::ClientEvent;
use crate::cache::Cache;
use crate::model::event::Event;
use crate::model::guild::Member;
use crate::model::id::{GuildId, ShardId};

/// Applies one dispatch event to the cache, returning the consumer-facing
/// event.
pub(crate) fn update_cache(cache: &Cache, shard_id: ShardId, event: Event) -> Option<ClientEvent> {
    match event {
        Event::Ready(data) => {
            cache.users.write().insert(data.user.clone(), false);
            {
                let mut unavailable = cache.unavailable_guilds.write();
                for guild in &data.guilds {
                    unavailable.insert(guild.id);
                }
            }

            Some(ClientEvent::Ready { shard_id, data })
        },
        Event::Resumed => Some(ClientEvent::Resumed { shard_id }),
        Event::GuildCreate(payload) => {
            let guild_id = payload.guild.id;
            cache.unavailable_guilds.write().remove(&guild_id);

            let guild = payload.guild;
            cache.guilds.write().insert(guild.clone(), false);

            {
                let mut channels = cache.channels.write();
                for channel in payload.channels {
                    channels.insert(channel, false);
                }
            }
            {
                let mut roles = cache.roles.write();
                for mut role in payload.roles {
                    role.guild_id = guild_id;
                    roles.insert(role, false);
                }
            }

            insert_members(cache, guild_id, payload.members);

            {
                let mut voice_states = cache.voice_states.write();
                let store = voice_states.entry(guild_id).or_default();
                for mut state in payload.voice_states {
                    state.guild_id = Some(guild_id);
                    store.insert(state, false);
                }
            }

            Some(ClientEvent::GuildCreate { guild })
        },
        Event::GuildUpdate(guild) => {
            let old = cache.guild(guild.id);
            let resident = cache.guilds.write().insert(guild, false);
            let guild = resident.read().clone();

            Some(ClientEvent::GuildUpdate { old, guild })
        },
        Event::GuildDelete(unavailable_guild) => {
            let guild_id = unavailable_guild.id;

            if unavailable_guild.unavailable {
                // An outage, not a removal; keep the guild but flag it.
                cache.unavailable_guilds.write().insert(guild_id);
                let guild = cache.guilds.read().get(&guild_id).map(|resident| {
                    let mut guild = resident.write();
                    guild.unavailable = true;
                    guild.clone()
                });

                Some(ClientEvent::GuildDelete {
                    guild_id,
                    guild,
                    unavailable: true,
                })
            } else {
                cache.unavailable_guilds.write().remove(&guild_id);
                let guild = cache.forget_guild(guild_id);

                Some(ClientEvent::GuildDelete {
                    guild_id,
                    guild,
                    unavailable: false,
                })
            }
        },
        Event::GuildMemberAdd(member) => {
            let guild_id = member.guild_id;
            insert_members(cache, guild_id, vec![member.clone()]);

            if let Some(guild) = cache.guilds.read().get(&guild_id) {
                guild.write().member_count += 1;
            }

            Some(ClientEvent::MemberAdd { member })
        },
        Event::GuildMemberUpdate(member) => {
            let old = cache.member(member.guild_id, member.user.id);
            let guild_id = member.guild_id;
            insert_members(cache, guild_id, vec![member.clone()]);
            let member = cache.member(guild_id, member.user.id).unwrap_or(member);

            Some(ClientEvent::MemberUpdate { old, member })
        },
        Event::GuildMemberRemove(event) => {
            let member = cache
                .members
                .write()
                .get_mut(&event.guild_id)
                .and_then(|store| store.remove(&event.user.id))
                .map(|resident| resident.read().clone());

            if let Some(guild) = cache.guilds.read().get(&event.guild_id) {
                let mut guild = guild.write();
                guild.member_count = guild.member_count.saturating_sub(1);
            }

            Some(ClientEvent::MemberRemove {
                guild_id: event.guild_id,
                user: event.user,
                member,
            })
        },
        Event::GuildMembersChunk(chunk) => {
            debug!(
                "Caching chunk {}/{} for guild {}",
                chunk.chunk_index + 1,
                chunk.chunk_count,
                chunk.guild_id,
            );

            let mut members = chunk.members.clone();
            for member in &mut members {
                member.guild_id = chunk.guild_id;
            }
            insert_members(cache, chunk.guild_id, members);

            Some(ClientEvent::GuildMembersChunk { chunk })
        },
        Event::GuildRoleCreate(event) => {
            let mut role = event.role;
            role.guild_id = event.guild_id;
            cache.roles.write().insert(role.clone(), false);

            Some(ClientEvent::RoleCreate { role })
        },
        Event::GuildRoleUpdate(event) => {
            let mut role = event.role;
            role.guild_id = event.guild_id;

            let old = cache.role(role.id);
            let resident = cache.roles.write().insert(role, false);
            let role = resident.read().clone();

            Some(ClientEvent::RoleUpdate { old, role })
        },
        Event::GuildRoleDelete(event) => {
            let role = cache
                .roles
                .write()
                .remove(&event.role_id)
                .map(|resident| resident.read().clone());

            Some(ClientEvent::RoleDelete {
                guild_id: event.guild_id,
                role_id: event.role_id,
                role,
            })
        },
        Event::ChannelCreate(channel) => {
            cache.channels.write().insert(channel.clone(), false);

            Some(ClientEvent::ChannelCreate { channel })
        },
        Event::ChannelUpdate(channel) => {
            let old = cache.channel(channel.id());
            cache.channels.write().insert(channel.clone(), true);

            Some(ClientEvent::ChannelUpdate { old, channel })
        },
        Event::ChannelDelete(channel) => {
            cache.channels.write().remove(&channel.id());

            Some(ClientEvent::ChannelDelete { channel })
        },
        Event::MessageCreate(message) => {
            cache.users.write().insert(message.author.clone(), false);
            cache.messages.write().insert((*message).clone(), false);

            Some(ClientEvent::MessageCreate { message })
        },
        Event::MessageUpdate(event) => {
            let old = cache.message(event.id);
            let message = cache.messages.read().get(&event.id).map(|resident| {
                let mut message = resident.write();
                event.apply_to(&mut message);
                message.clone()
            });

            Some(ClientEvent::MessageUpdate { old, message, event })
        },
        Event::MessageDelete(event) => {
            let message = cache
                .messages
                .write()
                .remove(&event.message_id)
                .map(|resident| resident.read().clone());

            Some(ClientEvent::MessageDelete {
                channel_id: event.channel_id,
                message_id: event.message_id,
                message,
            })
        },
        Event::PresenceUpdate(presence) => Some(ClientEvent::PresenceUpdate { presence }),
        Event::VoiceStateUpdate(state) => {
            let old = state
                .guild_id
                .and_then(|guild_id| cache.voice_state(guild_id, state.user_id));

            if let Some(guild_id) = state.guild_id {
                let mut voice_states = cache.voice_states.write();
                let store = voice_states.entry(guild_id).or_default();

                if state.channel_id.is_some() {
                    store.insert(state.clone(), true);
                } else {
                    // The user left voice entirely.
                    store.remove(&state.user_id);
                }
            }

            Some(ClientEvent::VoiceStateUpdate { old, state })
        },
        Event::VoiceServerUpdate(update) => Some(ClientEvent::VoiceServerUpdate { update }),
        Event::Unknown { kind, value } => Some(ClientEvent::Unknown { kind, value }),
    }
}

/// Inserts members into a guild's partition, feeding their users into the
/// shared user store as well.
fn insert_members(cache: &Cache, guild_id: GuildId, members: Vec<Member>) {
    let mut users = cache.users.write();
    let mut partitions = cache.members.write();
    let store = partitions.entry(guild_id).or_default();

    for mut member in members {
        member.guild_id = guild_id;
        users.insert(member.user.clone(), false);
        store.insert(member, false);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::update_cache;
    use crate::cache::Cache;
    use crate::client::ClientEvent;
    use crate::model::event::Event;
    use crate::model::id::{ChannelId, GuildId, MessageId, ShardId, UserId};

    fn apply(cache: &Cache, kind: &str, value: serde_json::Value) -> Option<ClientEvent> {
        update_cache(cache, ShardId(0), Event::decode(kind, value))
    }

    fn guild_create(id: u64, name: &str) -> serde_json::Value {
        json!({
            "id": id.to_string(),
            "name": name,
            "member_count": 1,
            "channels": [
                {"id": (id * 10).to_string(), "type": 0, "guild_id": id.to_string(), "name": "general"},
            ],
            "roles": [{"id": (id * 100).to_string(), "name": "admin"}],
            "members": [{"user": {"id": "77", "username": "someone"}}],
        })
    }

    #[test]
    fn guild_create_distributes_into_stores() {
        let cache = Cache::default();
        apply(&cache, "GUILD_CREATE", guild_create(1, "one"));

        assert_eq!(cache.guild_count(), 1);
        assert!(cache.channel(ChannelId::new(10)).is_some());
        assert!(cache.member(GuildId::new(1), UserId::new(77)).is_some());
        assert_eq!(cache.user(UserId::new(77)).unwrap().name, "someone");

        // The role payload has no guild id of its own; dispatch fills it in.
        let roles = cache.guild_roles(GuildId::new(1));
        assert_eq!(roles.len(), 1);
        assert_eq!(roles[0].guild_id, GuildId::new(1));
    }

    #[test]
    fn guild_delete_drops_the_guild_and_its_dependents() {
        let cache = Cache::default();
        for (id, name) in [(1, "one"), (2, "two"), (3, "three")] {
            apply(&cache, "GUILD_CREATE", guild_create(id, name));
        }
        assert_eq!(cache.guild_count(), 3);

        let event = apply(&cache, "GUILD_DELETE", json!({"id": "2"})).unwrap();
        match event {
            ClientEvent::GuildDelete { guild, unavailable, .. } => {
                assert_eq!(guild.unwrap().name, "two");
                assert!(!unavailable);
            },
            other => panic!("wrong event: {other:?}"),
        }

        assert_eq!(cache.guild_count(), 2);
        assert!(cache.channel(ChannelId::new(20)).is_none());
        assert!(cache.member(GuildId::new(2), UserId::new(77)).is_none());
        assert!(cache.guild_roles(GuildId::new(2)).is_empty());

        // The other guilds' dependents are untouched.
        assert!(cache.channel(ChannelId::new(10)).is_some());
        assert!(cache.channel(ChannelId::new(30)).is_some());
    }

    #[test]
    fn guild_outage_keeps_the_guild_flagged_unavailable() {
        let cache = Cache::default();
        apply(&cache, "GUILD_CREATE", guild_create(1, "one"));

        apply(&cache, "GUILD_DELETE", json!({"id": "1", "unavailable": true}));

        assert!(cache.is_guild_unavailable(GuildId::new(1)));
        assert!(cache.guild(GuildId::new(1)).unwrap().unavailable);

        // The guild coming back clears the flag.
        apply(&cache, "GUILD_CREATE", guild_create(1, "one"));
        assert!(!cache.is_guild_unavailable(GuildId::new(1)));
    }

    #[test]
    fn member_add_and_remove_track_the_count()  {
        let cache = Cache::default();
        apply(&cache, "GUILD_CREATE", guild_create(1, "one"));

        apply(
            &cache,
            "GUILD_MEMBER_ADD",
            json!({"guild_id": "1", "user": {"id": "88", "username": "new"}}),
        );
        assert_eq!(cache.guild(GuildId::new(1)).unwrap().member_count, 2);
        assert!(cache.member(GuildId::new(1), UserId::new(88)).is_some());

        let event = apply(
            &cache,
            "GUILD_MEMBER_REMOVE",
            json!({"guild_id": "1", "user": {"id": "88", "username": "new"}}),
        )
        .unwrap();
        match event {
            ClientEvent::MemberRemove { member, .. } => assert!(member.is_some()),
            other => panic!("wrong event: {other:?}"),
        }
        assert_eq!(cache.guild(GuildId::new(1)).unwrap().member_count, 1);
        assert!(cache.member(GuildId::new(1), UserId::new(88)).is_none());
    }

    #[test]
    fn message_update_snapshots_the_old_copy() {
        let cache = Cache::default();
        apply(
            &cache,
            "MESSAGE_CREATE",
            json!({
                "id": "5",
                "channel_id": "2",
                "author": {"id": "1", "username": "someone"},
                "content": "before",
            }),
        );

        let event = apply(
            &cache,
            "MESSAGE_UPDATE",
            json!({"id": "5", "channel_id": "2", "content": "after"}),
        )
        .unwrap();

        match event {
            ClientEvent::MessageUpdate { old, message, .. } => {
                assert_eq!(old.unwrap().content, "before");
                assert_eq!(message.unwrap().content, "after");
            },
            other => panic!("wrong event: {other:?}"),
        }
        assert_eq!(cache.message(MessageId::new(5)).unwrap().content, "after");
    }

    #[test]
    fn update_of_an_uncached_message_carries_only_the_event() {
        let cache = Cache::default();
        let event = apply(
            &cache,
            "MESSAGE_UPDATE",
            json!({"id": "5", "channel_id": "2", "content": "after"}),
        )
        .unwrap();

        match event {
            ClientEvent::MessageUpdate { old, message, event } => {
                assert!(old.is_none());
                assert!(message.is_none());
                assert_eq!(event.content.as_deref(), Some("after"));
            },
            other => panic!("wrong event: {other:?}"),
        }
    }

    #[test]
    fn leaving_voice_removes_the_state() {
        let cache = Cache::default();
        apply(
            &cache,
            "VOICE_STATE_UPDATE",
            json!({"guild_id": "1", "channel_id": "2", "user_id": "3", "session_id": "abc"}),
        );
        assert!(cache.voice_state(GuildId::new(1), UserId::new(3)).is_some());

        let event = apply(
            &cache,
            "VOICE_STATE_UPDATE",
            json!({"guild_id": "1", "channel_id": null, "user_id": "3", "session_id": "abc"}),
        )
        .unwrap();

        match event {
            ClientEvent::VoiceStateUpdate { old, state } => {
                assert_eq!(old.unwrap().channel_id, Some(ChannelId::new(2)));
                assert!(state.channel_id.is_none());
            },
            other => panic!("wrong event: {other:?}"),
        }
        assert!(cache.voice_state(GuildId::new(1), UserId::new(3)).is_none());
    }
}
