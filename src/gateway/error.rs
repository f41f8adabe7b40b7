use std::error::Error as StdError;
use std::fmt;

use tokio_tungstenite::tungstenite::protocol::CloseFrame;

/// An error that occurred while attempting to deal with the gateway.
///
/// The fatal variants leave the shard disconnected with no reconnect
/// scheduled; everything else is handled by the shard's reconnect logic.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum Error {
    /// There was an error building a URL.
    BuildingUrl,
    /// The connection closed, potentially uncleanly.
    Closed(Option<CloseFrame<'static>>),
    /// Invalid authentication (a bad token) was sent in the identify.
    InvalidAuthentication,
    /// An unknown opcode was received from the gateway.
    InvalidOpCode,
    /// Invalid sharding data was sent in the identify.
    ///
    /// Sending a shard id of 5 when sharding with 3 total is invalid.
    InvalidShardData,
    /// No authentication was sent in the identify.
    NoAuthentication,
    /// A session id was expected for resuming, but was not present.
    NoSessionId,
    /// The shard would have too many guilds assigned to it.
    OverloadedShard,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BuildingUrl => f.write_str("Error building url"),
            Self::Closed(_) => f.write_str("Connection closed"),
            Self::InvalidAuthentication => f.write_str("Sent invalid authentication"),
            Self::InvalidOpCode => f.write_str("Invalid OpCode"),
            Self::InvalidShardData => f.write_str("Sent invalid shard data"),
            Self::NoAuthentication => f.write_str("Sent no authentication"),
            Self::NoSessionId => f.write_str("No session id present when required"),
            Self::OverloadedShard => f.write_str("Shard has too many guilds"),
        }
    }
}

impl Error {
    /// Whether reconnecting could ever succeed after this error.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::BuildingUrl
                | Self::InvalidAuthentication
                | Self::NoAuthentication
                | Self::InvalidShardData
                | Self::OverloadedShard
        )
    }
}

impl StdError for Error {}

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn only_unrecoverable_errors_are_fatal() {
        assert!(Error::InvalidAuthentication.is_fatal());
        assert!(Error::NoAuthentication.is_fatal());
        assert!(Error::BuildingUrl.is_fatal());

        assert!(!Error::Closed(None).is_fatal());
        assert!(!Error::NoSessionId.is_fatal());
        assert!(!Error::InvalidOpCode.is_fatal());
    }
}
