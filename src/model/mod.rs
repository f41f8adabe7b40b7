//! Mappings of entities received from the remote service.
//!
//! Entities are lean: they keep the fields the cache and the event stream
//! need, cross-reference each other by id rather than by embedded copies,
//! and tolerate unknown fields on the wire.

pub mod channel;
pub mod event;
pub mod gateway;
pub mod guild;
pub mod id;
pub mod user;
pub mod voice;

/// A set of model exports for convenient glob-importing.
pub mod prelude {
    pub use super::channel::{Channel, Message};
    pub use super::gateway::{ActivityData, OnlineStatus, Presence, PresenceData, Ready, ShardInfo};
    pub use super::guild::{Guild, Member, Role, UnavailableGuild};
    pub use super::id::*;
    pub use super::user::User;
    pub use super::voice::{VoiceServerUpdateEvent, VoiceState};
}
