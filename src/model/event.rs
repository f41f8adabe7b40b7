//! Gateway event decoding.
//!
//! Frames arrive as `{op, s?, t?, d}` objects. The opcode layer is decoded
//! into [`GatewayEvent`]; dispatch frames (`op` 0) carry a named event whose
//! payload decodes into the closed [`Event`] sum. Unknown event names, and
//! known names whose payloads fail to decode, degrade to [`Event::Unknown`]
//! with a warning rather than tearing the connection down.

use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::constants::Opcode;
use crate::gateway::GatewayError;
use crate::model::channel::{Channel, Message};
use crate::model::gateway::{Presence, Ready};
use crate::model::guild::{Guild, Member, Role, UnavailableGuild};
use crate::model::id::{ChannelId, GuildId, MessageId, RoleId};
use crate::model::user::User;
use crate::model::voice::{VoiceServerUpdateEvent, VoiceState};
use crate::{Error, Result};

/// An opcode-level frame from the gateway.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum GatewayEvent {
    /// A named event, with the ordinal used for resuming.
    Dispatch { seq: u64, event: Event },
    /// A request that the client heartbeat immediately, carrying the
    /// service's view of the last sequence.
    Heartbeat(u64),
    /// A request that the client reconnect and resume.
    Reconnect,
    /// The session is invalid; resume only if the flag allows it.
    InvalidateSession { resumable: bool },
    /// The first frame after connecting; carries the heartbeat interval in
    /// milliseconds.
    Hello { heartbeat_interval: u64 },
    /// Acknowledges a client heartbeat.
    HeartbeatAck,
}

impl GatewayEvent {
    /// Decodes a raw frame.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidOpCode`] when the opcode is missing or
    /// unknown, and [`Error::Json`] when a control payload is malformed.
    pub fn decode(mut value: Value) -> Result<Self> {
        let op = value
            .get("op")
            .and_then(Value::as_u64)
            .and_then(Opcode::from_num)
            .ok_or(Error::Gateway(GatewayError::InvalidOpCode))?;

        Ok(match op {
            Opcode::Dispatch => {
                let seq = value.get("s").and_then(Value::as_u64).unwrap_or_default();
                let kind = value
                    .get("t")
                    .and_then(Value::as_str)
                    .map(str::to_owned)
                    .ok_or(Error::Other("dispatch frame missing event type"))?;
                let data = value.get_mut("d").map(Value::take).unwrap_or(Value::Null);

                Self::Dispatch {
                    seq,
                    event: Event::decode(&kind, data),
                }
            },
            Opcode::Heartbeat => {
                Self::Heartbeat(value.get("d").and_then(Value::as_u64).unwrap_or_default())
            },
            Opcode::Reconnect => Self::Reconnect,
            Opcode::InvalidSession => Self::InvalidateSession {
                resumable: value.get("d").and_then(Value::as_bool).unwrap_or_default(),
            },
            Opcode::Hello => {
                #[derive(Deserialize)]
                struct Hello {
                    heartbeat_interval: u64,
                }

                let data = value.get_mut("d").map(Value::take).unwrap_or(Value::Null);
                let hello: Hello = serde_json::from_value(data)?;

                Self::Hello {
                    heartbeat_interval: hello.heartbeat_interval,
                }
            },
            Opcode::HeartbeatAck => Self::HeartbeatAck,
            _ => return Err(Error::Gateway(GatewayError::InvalidOpCode)),
        })
    }
}

/// The full guild payload delivered with a create event: the guild itself
/// plus the entity lists dispatch distributes into their own stores.
#[derive(Clone, Debug, Deserialize)]
#[non_exhaustive]
pub struct GuildCreateEvent {
    #[serde(flatten)]
    pub guild: Guild,
    #[serde(default)]
    pub channels: Vec<Channel>,
    #[serde(default)]
    pub members: Vec<Member>,
    #[serde(default)]
    pub roles: Vec<Role>,
    #[serde(default)]
    pub voice_states: Vec<VoiceState>,
}

/// One chunk of a large guild's member sync.
#[derive(Clone, Debug, Deserialize)]
#[non_exhaustive]
pub struct GuildMembersChunkEvent {
    pub guild_id: GuildId,
    #[serde(default)]
    pub members: Vec<Member>,
    #[serde(default)]
    pub chunk_index: u32,
    #[serde(default)]
    pub chunk_count: u32,
}

/// The partial payload of a message update; only changed fields are present.
#[derive(Clone, Debug, Deserialize)]
#[non_exhaustive]
pub struct MessageUpdateEvent {
    pub id: MessageId,
    pub channel_id: ChannelId,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub edited_timestamp: Option<String>,
    #[serde(default)]
    pub pinned: Option<bool>,
}

impl MessageUpdateEvent {
    /// Applies the changed fields onto a resident message.
    pub fn apply_to(&self, message: &mut Message) {
        if let Some(content) = &self.content {
            message.content.clone_from(content);
        }
        if self.edited_timestamp.is_some() {
            message.edited_timestamp.clone_from(&self.edited_timestamp);
        }
        if let Some(pinned) = self.pinned {
            message.pinned = pinned;
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[non_exhaustive]
pub struct MessageDeleteEvent {
    #[serde(rename = "id")]
    pub message_id: MessageId,
    pub channel_id: ChannelId,
}

#[derive(Clone, Debug, Deserialize)]
#[non_exhaustive]
pub struct GuildMemberRemoveEvent {
    pub guild_id: GuildId,
    pub user: User,
}

#[derive(Clone, Debug, Deserialize)]
#[non_exhaustive]
pub struct GuildRoleEvent {
    pub guild_id: GuildId,
    pub role: Role,
}

#[derive(Clone, Debug, Deserialize)]
#[non_exhaustive]
pub struct GuildRoleDeleteEvent {
    pub guild_id: GuildId,
    pub role_id: RoleId,
}

/// A dispatch event, decoded by name.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum Event {
    Ready(Box<Ready>),
    Resumed,
    GuildCreate(Box<GuildCreateEvent>),
    GuildUpdate(Guild),
    GuildDelete(UnavailableGuild),
    GuildMemberAdd(Member),
    GuildMemberUpdate(Member),
    GuildMemberRemove(GuildMemberRemoveEvent),
    GuildMembersChunk(GuildMembersChunkEvent),
    GuildRoleCreate(GuildRoleEvent),
    GuildRoleUpdate(GuildRoleEvent),
    GuildRoleDelete(GuildRoleDeleteEvent),
    ChannelCreate(Channel),
    ChannelUpdate(Channel),
    ChannelDelete(Channel),
    MessageCreate(Box<Message>),
    MessageUpdate(MessageUpdateEvent),
    MessageDelete(MessageDeleteEvent),
    PresenceUpdate(Presence),
    VoiceStateUpdate(VoiceState),
    VoiceServerUpdate(VoiceServerUpdateEvent),
    /// An event the library does not recognize, or whose payload failed to
    /// decode. The raw payload is preserved for the consumer.
    Unknown { kind: String, value: Value },
}

impl Event {
    /// Decodes a named dispatch payload. Never fails: undecodable payloads
    /// become [`Event::Unknown`] so a malformed frame cannot take down the
    /// connection or lose the sequence ordinal recorded before decoding.
    #[must_use]
    pub fn decode(kind: &str, value: Value) -> Self {
        fn typed<T, F>(kind: &str, value: Value, wrap: F) -> Event
        where
            T: serde::de::DeserializeOwned,
            F: FnOnce(T) -> Event,
        {
            match serde_json::from_value::<T>(value.clone()) {
                Ok(payload) => wrap(payload),
                Err(why) => {
                    warn!("Err deserializing {kind} payload: {why}");

                    Event::Unknown {
                        kind: kind.to_owned(),
                        value,
                    }
                },
            }
        }

        match kind {
            "READY" => typed(kind, value, |p| Self::Ready(Box::new(p))),
            "RESUMED" => Self::Resumed,
            "GUILD_CREATE" => typed(kind, value, |p| Self::GuildCreate(Box::new(p))),
            "GUILD_UPDATE" => typed(kind, value, Self::GuildUpdate),
            "GUILD_DELETE" => typed(kind, value, Self::GuildDelete),
            "GUILD_MEMBER_ADD" => typed(kind, value, Self::GuildMemberAdd),
            "GUILD_MEMBER_UPDATE" => typed(kind, value, Self::GuildMemberUpdate),
            "GUILD_MEMBER_REMOVE" => typed(kind, value, Self::GuildMemberRemove),
            "GUILD_MEMBERS_CHUNK" => typed(kind, value, Self::GuildMembersChunk),
            "GUILD_ROLE_CREATE" => typed(kind, value, Self::GuildRoleCreate),
            "GUILD_ROLE_UPDATE" => typed(kind, value, Self::GuildRoleUpdate),
            "GUILD_ROLE_DELETE" => typed(kind, value, Self::GuildRoleDelete),
            "CHANNEL_CREATE" => typed(kind, value, Self::ChannelCreate),
            "CHANNEL_UPDATE" => typed(kind, value, Self::ChannelUpdate),
            "CHANNEL_DELETE" => typed(kind, value, Self::ChannelDelete),
            "MESSAGE_CREATE" => typed(kind, value, |p| Self::MessageCreate(Box::new(p))),
            "MESSAGE_UPDATE" => typed(kind, value, Self::MessageUpdate),
            "MESSAGE_DELETE" => typed(kind, value, Self::MessageDelete),
            "PRESENCE_UPDATE" => typed(kind, value, Self::PresenceUpdate),
            "VOICE_STATE_UPDATE" => typed(kind, value, Self::VoiceStateUpdate),
            "VOICE_SERVER_UPDATE" => typed(kind, value, Self::VoiceServerUpdate),
            _ => Self::Unknown {
                kind: kind.to_owned(),
                value,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{Event, GatewayEvent};

    #[test]
    fn decodes_hello() {
        let frame = json!({"op": 10, "d": {"heartbeat_interval": 41250}});
        let event = GatewayEvent::decode(frame).unwrap();
        assert!(matches!(event, GatewayEvent::Hello { heartbeat_interval: 41250 }));
    }

    #[test]
    fn decodes_dispatch_with_sequence() {
        let frame = json!({
            "op": 0,
            "s": 42,
            "t": "MESSAGE_CREATE",
            "d": {
                "id": "3",
                "channel_id": "2",
                "author": {"id": "1", "username": "someone"},
                "content": "hello",
            },
        });

        match GatewayEvent::decode(frame).unwrap() {
            GatewayEvent::Dispatch { seq, event } => {
                assert_eq!(seq, 42);
                match event {
                    Event::MessageCreate(msg) => assert_eq!(msg.content, "hello"),
                    other => panic!("wrong event: {other:?}"),
                }
            },
            other => panic!("wrong frame: {other:?}"),
        }
    }

    #[test]
    fn unknown_event_kind_is_preserved() {
        let event = Event::decode("SOME_NEW_THING", json!({"a": 1}));
        match event {
            Event::Unknown { kind, value } => {
                assert_eq!(kind, "SOME_NEW_THING");
                assert_eq!(value["a"], 1);
            },
            other => panic!("wrong event: {other:?}"),
        }
    }

    #[test]
    fn malformed_known_payload_degrades_to_unknown() {
        let event = Event::decode("MESSAGE_CREATE", json!({"id": true}));
        assert!(matches!(event, Event::Unknown { .. }));
    }

    #[test]
    fn missing_opcode_is_an_error() {
        assert!(GatewayEvent::decode(json!({"d": null})).is_err());
        assert!(GatewayEvent::decode(json!({"op": 99})).is_err());
    }

    #[test]
    fn guild_create_flattens_entity_lists() {
        let event = Event::decode(
            "GUILD_CREATE",
            json!({
                "id": "10",
                "name": "somewhere",
                "large": false,
                "channels": [{"id": "11", "type": 0, "guild_id": "10", "name": "general"}],
                "roles": [{"id": "12", "name": "admin"}],
                "members": [{"user": {"id": "13", "username": "someone"}}],
            }),
        );

        match event {
            Event::GuildCreate(payload) => {
                assert_eq!(payload.guild.id.get(), 10);
                assert_eq!(payload.channels.len(), 1);
                assert_eq!(payload.roles.len(), 1);
                assert_eq!(payload.members.len(), 1);
            },
            other => panic!("wrong event: {other:?}"),
        }
    }
}
