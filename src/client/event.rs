use serde_json::Value;

use crate::gateway::GatewayError;
use crate::model::channel::{Channel, Message};
use crate::model::event::{GuildMembersChunkEvent, MessageUpdateEvent};
use crate::model::gateway::{Presence, Ready};
use crate::model::guild::{Guild, Member, Role};
use crate::model::id::{ChannelId, GuildId, MessageId, RoleId, ShardId};
use crate::model::user::User;
use crate::model::voice::{VoiceServerUpdateEvent, VoiceState};

/// An event delivered to the consumer after the cache has been updated.
///
/// Where an update overwrote cached state, the pre-update snapshot rides
/// along as `old`; it is `None` when the entity was never cached.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum ClientEvent {
    /// A shard completed its identify handshake.
    Ready {
        shard_id: ShardId,
        data: Box<Ready>,
    },
    /// A shard resumed its session after a disconnect.
    Resumed {
        shard_id: ShardId,
    },
    /// Every shard has reported Ready at least once. Emitted a single time
    /// per client; later resumes and reidentifies do not repeat it.
    AllShardsReady,
    /// A shard hit an error that reconnecting cannot fix and has stopped.
    ShardFatal {
        shard_id: ShardId,
        error: GatewayError,
    },
    GuildCreate {
        guild: Guild,
    },
    GuildUpdate {
        old: Option<Guild>,
        guild: Guild,
    },
    GuildDelete {
        guild_id: GuildId,
        /// The cached guild, when there was one to evict.
        guild: Option<Guild>,
        /// Whether this is an outage rather than a removal; the guild stays
        /// cached, flagged unavailable.
        unavailable: bool,
    },
    ChannelCreate {
        channel: Channel,
    },
    ChannelUpdate {
        old: Option<Channel>,
        channel: Channel,
    },
    ChannelDelete {
        channel: Channel,
    },
    MessageCreate {
        message: Box<Message>,
    },
    MessageUpdate {
        old: Option<Message>,
        /// The post-update message, when it was cached.
        message: Option<Message>,
        event: MessageUpdateEvent,
    },
    MessageDelete {
        channel_id: ChannelId,
        message_id: MessageId,
        /// The deleted message, when it was still cached.
        message: Option<Message>,
    },
    MemberAdd {
        member: Member,
    },
    MemberUpdate {
        old: Option<Member>,
        member: Member,
    },
    MemberRemove {
        guild_id: GuildId,
        user: User,
        member: Option<Member>,
    },
    GuildMembersChunk {
        chunk: GuildMembersChunkEvent,
    },
    RoleCreate {
        role: Role,
    },
    RoleUpdate {
        old: Option<Role>,
        role: Role,
    },
    RoleDelete {
        guild_id: GuildId,
        role_id: RoleId,
        role: Option<Role>,
    },
    PresenceUpdate {
        presence: Presence,
    },
    VoiceStateUpdate {
        old: Option<VoiceState>,
        state: VoiceState,
    },
    VoiceServerUpdate {
        update: VoiceServerUpdateEvent,
    },
    /// A voice connection was torn down without a replacement.
    VoiceDisconnect {
        guild_id: GuildId,
    },
    /// An event the library does not recognize, passed through raw.
    Unknown {
        kind: String,
        value: Value,
    },
}
