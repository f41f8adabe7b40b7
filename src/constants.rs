//! Constants shared by the gateway and REST layers.

/// The base URL for REST calls.
pub const API_BASE: &str = "https://discord.com/api/v10";
/// The gateway version appended to the WebSocket URL.
pub const GATEWAY_VERSION: u8 = 10;
/// The voice gateway version used for voice signaling connections.
pub const VOICE_GATEWAY_VERSION: u8 = 4;
/// Member count at which a guild is considered "large" and is synced in
/// chunks rather than inline with its create event.
pub const LARGE_THRESHOLD: u8 = 250;
/// The `UserAgent` sent along with every request.
pub const USER_AGENT: &str =
    concat!("DiscordBot (https://github.com/concord-rs/concord, ", env!("CARGO_PKG_VERSION"), ")");

/// An enum representing the gateway opcodes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum Opcode {
    /// Dispatches a gateway event.
    Dispatch = 0,
    /// Used for ping checking.
    Heartbeat = 1,
    /// Used for client handshake.
    Identify = 2,
    /// Used to update the client status.
    PresenceUpdate = 3,
    /// Used to join/move/leave voice channels.
    VoiceStateUpdate = 4,
    /// Used to resume a closed connection.
    Resume = 6,
    /// Used to tell clients to reconnect to the gateway.
    Reconnect = 7,
    /// Used to request member chunks.
    RequestGuildMembers = 8,
    /// Used to notify clients that they have an invalid session Id.
    InvalidSession = 9,
    /// Sent immediately after connecting; contains the heartbeat interval.
    Hello = 10,
    /// Sent immediately following a client heartbeat that was received.
    HeartbeatAck = 11,
}

impl Opcode {
    pub fn from_num(num: u64) -> Option<Self> {
        match num {
            0 => Some(Self::Dispatch),
            1 => Some(Self::Heartbeat),
            2 => Some(Self::Identify),
            3 => Some(Self::PresenceUpdate),
            4 => Some(Self::VoiceStateUpdate),
            6 => Some(Self::Resume),
            7 => Some(Self::Reconnect),
            8 => Some(Self::RequestGuildMembers),
            9 => Some(Self::InvalidSession),
            10 => Some(Self::Hello),
            11 => Some(Self::HeartbeatAck),
            _ => None,
        }
    }

    #[must_use]
    pub const fn num(self) -> u8 {
        self as u8
    }
}

/// An enum representing the voice signaling opcodes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum VoiceOpcode {
    Identify = 0,
    SelectProtocol = 1,
    Ready = 2,
    Heartbeat = 3,
    SessionDescription = 4,
    Speaking = 5,
    HeartbeatAck = 6,
    Resume = 7,
    Hello = 8,
    Resumed = 9,
}

impl VoiceOpcode {
    pub fn from_num(num: u64) -> Option<Self> {
        match num {
            0 => Some(Self::Identify),
            1 => Some(Self::SelectProtocol),
            2 => Some(Self::Ready),
            3 => Some(Self::Heartbeat),
            4 => Some(Self::SessionDescription),
            5 => Some(Self::Speaking),
            6 => Some(Self::HeartbeatAck),
            7 => Some(Self::Resume),
            8 => Some(Self::Hello),
            9 => Some(Self::Resumed),
            _ => None,
        }
    }

    #[must_use]
    pub const fn num(self) -> u8 {
        self as u8
    }
}

/// Close codes sent by the gateway when tearing down a connection.
pub mod close_codes {
    /// An unknown opcode was sent.
    pub const UNKNOWN_OPCODE: u16 = 4001;
    /// An invalid payload was sent.
    pub const DECODE_ERROR: u16 = 4002;
    /// A payload was sent prior to identifying.
    pub const NOT_AUTHENTICATED: u16 = 4003;
    /// An invalid token was sent in the identify.
    pub const AUTHENTICATION_FAILED: u16 = 4004;
    /// Multiple identifies were sent on one connection.
    pub const ALREADY_AUTHENTICATED: u16 = 4005;
    /// An invalid sequence was sent for resuming.
    pub const INVALID_SEQUENCE: u16 = 4007;
    /// Too many payloads were sent in a short span of time.
    pub const RATE_LIMITED: u16 = 4008;
    /// The session timed out and is beyond the resume window.
    pub const SESSION_TIMEOUT: u16 = 4009;
    /// An invalid shard was sent in the identify.
    pub const INVALID_SHARD: u16 = 4010;
    /// The session would have handled too many guilds.
    pub const SHARDING_REQUIRED: u16 = 4011;
}
