use std::error::Error as StdError;
use std::fmt;

/// An error within the voice subsystem.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum Error {
    /// The shard carrying the guild has not finished identifying, so there
    /// is nothing to send the voice-state update over.
    NoShard,
    /// No voice connection exists for the guild.
    NotConnected,
    /// The session/server credentials never arrived over the gateway.
    ConnectionTimeout,
    /// The signaling endpoint could not be turned into a URL.
    EndpointInvalid,
    /// Playback was requested while the connection was not ready for it.
    NotReadyForPlayback,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoShard => f.write_str("No ready shard carries the guild"),
            Self::NotConnected => f.write_str("No voice connection for the guild"),
            Self::ConnectionTimeout => f.write_str("Timed out waiting for voice credentials"),
            Self::EndpointInvalid => f.write_str("Invalid voice signaling endpoint"),
            Self::NotReadyForPlayback => f.write_str("Voice connection not ready for playback"),
        }
    }
}

impl StdError for Error {}
