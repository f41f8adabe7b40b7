//! Identifiers for entities received from the remote service.
//!
//! Every id is a snowflake: the upper bits encode the moment the id was
//! generated as a millisecond offset from the service epoch. The creation
//! time of any entity is therefore derived from its id, never stored.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::de::{Deserializer, Error as DeError, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

/// The service epoch: the first second of 2015, in milliseconds.
pub const EPOCH_MS: u64 = 1_420_070_400_000;

/// Number of low bits a snowflake reserves for worker/process/increment data.
const TIMESTAMP_SHIFT: u64 = 22;

struct SnowflakeVisitor;

impl<'de> Visitor<'de> for SnowflakeVisitor {
    type Value = u64;

    fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("a string or integer snowflake")
    }

    fn visit_u64<E: DeError>(self, value: u64) -> Result<u64, E> {
        Ok(value)
    }

    fn visit_str<E: DeError>(self, value: &str) -> Result<u64, E> {
        value.parse().map_err(|_| DeError::custom("invalid snowflake"))
    }
}

macro_rules! id_type {
    ($($(#[$attr:meta])* $name:ident;)+) => {$(
        $(#[$attr])*
        #[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
        pub struct $name(pub u64);

        impl $name {
            #[must_use]
            pub const fn new(id: u64) -> Self {
                Self(id)
            }

            #[must_use]
            pub const fn get(self) -> u64 {
                self.0
            }

            /// The time at which the id was generated, extracted from the
            /// snowflake's timestamp bits.
            #[must_use]
            pub fn created_at(self) -> SystemTime {
                let offset = (self.0 >> TIMESTAMP_SHIFT) + EPOCH_MS;
                UNIX_EPOCH + Duration::from_millis(offset)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<u64> for $name {
            fn from(id: u64) -> Self {
                Self(id)
            }
        }

        impl From<$name> for u64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        // Ids travel as strings on the wire but some payloads use integers.
        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                deserializer.deserialize_any(SnowflakeVisitor).map(Self)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(&self.0)
            }
        }
    )+};
}

id_type! {
    /// An identifier for an application.
    ApplicationId;
    /// An identifier for a channel.
    ChannelId;
    /// An identifier for an emoji.
    EmojiId;
    /// An identifier for a guild.
    GuildId;
    /// An identifier for a message.
    MessageId;
    /// An identifier for a role.
    RoleId;
    /// An identifier for a user.
    UserId;
}

/// An identifier for a shard.
///
/// Unlike the entity ids above this is a small ordinal, not a snowflake.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct ShardId(pub u16);

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use super::{GuildId, UserId, EPOCH_MS};

    #[test]
    fn created_at_extracts_the_timestamp_bits() {
        // 1 << 22 is exactly one millisecond past the epoch.
        let id = GuildId::new(1 << 22);
        assert_eq!(id.created_at(), UNIX_EPOCH + Duration::from_millis(EPOCH_MS + 1));

        let id = GuildId::new(81_384_788_765_712_384);
        let expected_ms = (81_384_788_765_712_384u64 >> 22) + EPOCH_MS;
        assert_eq!(id.created_at(), UNIX_EPOCH + Duration::from_millis(expected_ms));
    }

    #[test]
    fn deserializes_from_string_or_integer() {
        let from_str: UserId = serde_json::from_str("\"175928847299117063\"").unwrap();
        let from_int: UserId = serde_json::from_str("175928847299117063").unwrap();
        assert_eq!(from_str, from_int);
        assert_eq!(from_str.get(), 175_928_847_299_117_063);
    }

    #[test]
    fn serializes_as_string() {
        let id = UserId::new(7);
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"7\"");
    }
}
