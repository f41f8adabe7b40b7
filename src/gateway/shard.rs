use std::fmt;
use std::time::Duration;

use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
use tracing::{debug, error, info, trace, warn};

use super::GatewayError;
use crate::constants::close_codes;
use crate::model::event::{Event, GatewayEvent};
use crate::model::gateway::{ActivityData, OnlineStatus, PresenceData, ShardInfo};
use crate::{Error, Result};

/// How long to wait for the initial Hello before treating the connection as
/// dead.
const HELLO_TIMEOUT: Duration = Duration::from_secs(15);

/// The per-shard protocol state machine.
///
/// A `Shard` tracks the connection stage, sequence number, session id and
/// heartbeat bookkeeping for one gateway connection. It owns no transport:
/// inbound frames are fed to [`Self::handle_event`] and
/// [`Self::handle_close`], which mutate state and return the [`ShardAction`]
/// the caller must perform. The [`ShardRunner`] owns the WebSocket and drives
/// the machine.
///
/// [`ShardRunner`]: super::ShardRunner
pub struct Shard {
    shard_info: ShardInfo,
    stage: ConnectionStage,
    seq: u64,
    session_id: Option<String>,
    resume_ws_url: Option<String>,
    presence: PresenceData,
    heartbeat_interval: Option<Duration>,
    last_heartbeat_sent: Option<Instant>,
    last_heartbeat_ack: Option<Instant>,
    /// Whether the last heartbeat was acknowledged. Set back to `true` in the
    /// `GatewayEvent::HeartbeatAck` arm of [`Self::handle_event`].
    last_heartbeat_acknowledged: bool,
    next_heartbeat: Option<Instant>,
    /// When the current connection attempt started, for the Hello timeout.
    started: Instant,
}

impl Shard {
    #[must_use]
    pub fn new(shard_info: ShardInfo, presence: Option<PresenceData>) -> Self {
        Self {
            shard_info,
            stage: ConnectionStage::Disconnected,
            seq: 0,
            session_id: None,
            resume_ws_url: None,
            presence: presence.unwrap_or_default(),
            heartbeat_interval: None,
            last_heartbeat_sent: None,
            last_heartbeat_ack: None,
            last_heartbeat_acknowledged: true,
            next_heartbeat: None,
            started: Instant::now(),
        }
    }

    /// Marks the transport as being opened.
    pub fn set_connecting(&mut self) {
        self.stage = ConnectionStage::Connecting;
    }

    /// Marks the transport as open and awaiting the Hello frame.
    pub fn set_handshake(&mut self, now: Instant) {
        self.stage = ConnectionStage::Handshake;
        self.started = now;
        self.heartbeat_interval = None;
        self.next_heartbeat = None;
        self.last_heartbeat_sent = None;
        self.last_heartbeat_ack = None;
        self.last_heartbeat_acknowledged = true;
    }

    /// Marks the identify as sent, awaiting Ready.
    pub fn set_identifying(&mut self) {
        self.stage = ConnectionStage::Identifying;
    }

    /// Marks the resume as sent, awaiting Resumed.
    pub fn set_resuming(&mut self) {
        self.stage = ConnectionStage::Resuming;
    }

    /// Forgets the session entirely; the next connection identifies fresh.
    pub fn reset(&mut self) {
        self.stage = ConnectionStage::Disconnected;
        self.seq = 0;
        self.session_id = None;
        self.resume_ws_url = None;
        self.heartbeat_interval = None;
        self.next_heartbeat = None;
        self.last_heartbeat_sent = None;
        self.last_heartbeat_ack = None;
        self.last_heartbeat_acknowledged = true;
    }

    /// Handles one decoded frame, returning the action to take and the
    /// dispatch event to surface, if any.
    pub fn handle_event(
        &mut self,
        event: GatewayEvent,
        now: Instant,
    ) -> (Option<ShardAction>, Option<Event>) {
        match event {
            GatewayEvent::Dispatch { seq, event } => {
                let action = self.handle_dispatch(seq, &event, now);
                (action, Some(event))
            },
            GatewayEvent::Heartbeat(s) => (Some(self.handle_heartbeat_request(s)), None),
            GatewayEvent::HeartbeatAck => {
                self.last_heartbeat_ack = Some(now);
                self.last_heartbeat_acknowledged = true;

                trace!("{} Received heartbeat ack", self.shard_info);

                (None, None)
            },
            GatewayEvent::Hello { heartbeat_interval } => {
                (self.handle_hello(heartbeat_interval, now), None)
            },
            GatewayEvent::InvalidateSession { resumable } => {
                info!("{} Received session invalidation", self.shard_info);

                if resumable {
                    (Some(ShardAction::Reconnect(ReconnectType::Resume)), None)
                } else {
                    self.session_id = None;
                    self.seq = 0;

                    (Some(ShardAction::Reconnect(ReconnectType::Reidentify)), None)
                }
            },
            GatewayEvent::Reconnect => {
                (Some(ShardAction::Reconnect(ReconnectType::Resume)), None)
            },
        }
    }

    fn handle_dispatch(&mut self, seq: u64, event: &Event, now: Instant) -> Option<ShardAction> {
        if seq > self.seq + 1 && self.seq != 0 {
            warn!("{} Sequence off; them: {seq}, us: {}", self.shard_info, self.seq);
        }

        // Recorded before the event is applied anywhere, so a disconnect
        // mid-processing still resumes from here.
        self.seq = seq;

        match event {
            Event::Ready(ready) => {
                debug!("{} Received Ready", self.shard_info);

                self.session_id = Some(ready.session_id.clone());
                self.resume_ws_url.clone_from(&ready.resume_gateway_url);
                self.stage = ConnectionStage::Connected;
            },
            Event::Resumed => {
                info!("{} Resumed", self.shard_info);

                self.stage = ConnectionStage::Connected;
                self.last_heartbeat_acknowledged = true;
                self.last_heartbeat_sent = Some(now);
                self.last_heartbeat_ack = None;
            },
            _ => {},
        }

        None
    }

    fn handle_heartbeat_request(&mut self, s: u64) -> ShardAction {
        info!("{} Received shard heartbeat", self.shard_info);

        // Received seq is off; get back in line.
        if s > self.seq + 1 {
            info!(
                "{} Received off sequence (them: {s}; us: {})",
                self.shard_info, self.seq
            );

            if self.stage == ConnectionStage::Handshake {
                return ShardAction::Identify;
            }

            warn!("{} Heartbeat during non-Handshake; auto-reconnecting", self.shard_info);
            return ShardAction::Reconnect(self.reconnection_type());
        }

        ShardAction::Heartbeat
    }

    fn handle_hello(&mut self, interval_ms: u64, now: Instant) -> Option<ShardAction> {
        debug!("{} Received a Hello; interval: {interval_ms}", self.shard_info);

        let interval = Duration::from_millis(interval_ms);
        self.heartbeat_interval = Some(interval);
        // The first beat is jittered so a fleet reconnecting at once does not
        // all heartbeat in step.
        self.next_heartbeat = Some(now + interval.mul_f64(rand::random::<f64>()));

        match self.stage {
            ConnectionStage::Resuming => None,
            ConnectionStage::Handshake => {
                if self.session_id.is_some() && self.seq > 0 {
                    Some(ShardAction::Resume)
                } else {
                    Some(ShardAction::Identify)
                }
            },
            _ => {
                debug!("{} Received late Hello; autoreconnecting", self.shard_info);

                Some(ShardAction::Reconnect(self.reconnection_type()))
            },
        }
    }

    /// Handles the connection closing, mapping the close code to either a
    /// reconnect action or a fatal error.
    ///
    /// # Errors
    ///
    /// Returns the fatal [`GatewayError`] variant matching the close code
    /// when reconnecting can never succeed.
    pub fn handle_close(&mut self, frame: Option<&CloseFrame<'_>>) -> Result<ShardAction> {
        let num: Option<u16> = frame.map(|d| d.code.into());
        let clean = num == Some(1000);

        match num {
            Some(close_codes::UNKNOWN_OPCODE) => {
                warn!("{} Sent invalid opcode", self.shard_info);
            },
            Some(close_codes::DECODE_ERROR) => {
                warn!("{} Sent invalid message", self.shard_info);
            },
            Some(close_codes::NOT_AUTHENTICATED) => {
                warn!("{} Sent no authentication", self.shard_info);

                self.stage = ConnectionStage::Disconnected;
                return Err(Error::Gateway(GatewayError::NoAuthentication));
            },
            Some(close_codes::AUTHENTICATION_FAILED) => {
                error!("{} Sent invalid authentication, check the token", self.shard_info);

                self.stage = ConnectionStage::Disconnected;
                return Err(Error::Gateway(GatewayError::InvalidAuthentication));
            },
            Some(close_codes::ALREADY_AUTHENTICATED) => {
                warn!("{} Already authenticated", self.shard_info);
            },
            Some(close_codes::INVALID_SEQUENCE) => {
                warn!("{} Sent invalid seq: {}", self.shard_info, self.seq);

                self.seq = 0;
            },
            Some(close_codes::RATE_LIMITED) => {
                warn!("{} Gateway ratelimited", self.shard_info);
            },
            Some(close_codes::INVALID_SHARD) => {
                warn!("{} Sent invalid shard data", self.shard_info);

                self.stage = ConnectionStage::Disconnected;
                return Err(Error::Gateway(GatewayError::InvalidShardData));
            },
            Some(close_codes::SHARDING_REQUIRED) => {
                error!("{} Shard has too many guilds", self.shard_info);

                self.stage = ConnectionStage::Disconnected;
                return Err(Error::Gateway(GatewayError::OverloadedShard));
            },
            Some(4006 | close_codes::SESSION_TIMEOUT) => {
                info!("{} Invalid session", self.shard_info);

                self.session_id = None;
                self.seq = 0;
            },
            Some(other) if !clean => {
                warn!(
                    "{} Unknown unclean close {other}: {:?}",
                    self.shard_info,
                    frame.map(|d| &d.reason),
                );
            },
            _ => {},
        }

        let resume = num.map_or(true, |x| {
            x != close_codes::AUTHENTICATION_FAILED && self.session_id.is_some()
        });

        Ok(if resume {
            ShardAction::Reconnect(ReconnectType::Resume)
        } else {
            ShardAction::Reconnect(ReconnectType::Reidentify)
        })
    }

    /// Whether a heartbeat is due, and whether the connection has gone
    /// zombie: a heartbeat was sent a full interval ago with no
    /// acknowledgment, or no Hello ever arrived.
    #[must_use]
    pub fn check_heartbeat(&self, now: Instant) -> HeartbeatStatus {
        if self.heartbeat_interval.is_none() {
            // Still waiting on the Hello.
            if now.saturating_duration_since(self.started) > HELLO_TIMEOUT
                && self.stage.is_connecting()
            {
                return HeartbeatStatus::Zombie;
            }

            return HeartbeatStatus::NotDue;
        }

        match self.next_heartbeat {
            Some(next) if now >= next => {
                if self.last_heartbeat_acknowledged {
                    HeartbeatStatus::Due
                } else {
                    HeartbeatStatus::Zombie
                }
            },
            _ => HeartbeatStatus::NotDue,
        }
    }

    /// Records a heartbeat as sent, scheduling the next one an interval out.
    pub fn heartbeat_sent(&mut self, now: Instant) {
        self.last_heartbeat_sent = Some(now);
        self.last_heartbeat_acknowledged = false;

        if let Some(interval) = self.heartbeat_interval {
            self.next_heartbeat = Some(now + interval);
        }
    }

    /// The latency between the last heartbeat and its acknowledgment.
    #[must_use]
    pub fn latency(&self) -> Option<Duration> {
        if let (Some(sent), Some(received)) = (self.last_heartbeat_sent, self.last_heartbeat_ack) {
            if received > sent {
                return Some(received - sent);
            }
        }

        None
    }

    #[must_use]
    pub fn reconnection_type(&self) -> ReconnectType {
        if self.session_id.is_some() {
            ReconnectType::Resume
        } else {
            ReconnectType::Reidentify
        }
    }

    #[must_use]
    pub fn stage(&self) -> ConnectionStage {
        self.stage
    }

    #[must_use]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Where to reconnect for a resume, when the service advertised one.
    #[must_use]
    pub fn resume_ws_url(&self) -> Option<&str> {
        self.resume_ws_url.as_deref()
    }

    #[must_use]
    pub fn shard_info(&self) -> ShardInfo {
        self.shard_info
    }

    #[must_use]
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat_interval
    }

    #[must_use]
    pub fn presence(&self) -> &PresenceData {
        &self.presence
    }

    pub fn set_activity(&mut self, activity: Option<ActivityData>) {
        self.presence.activity = activity;
    }

    pub fn set_status(&mut self, mut status: OnlineStatus) {
        if status == OnlineStatus::Offline {
            status = OnlineStatus::Invisible;
        }

        self.presence.status = status;
    }

    pub fn set_presence(&mut self, activity: Option<ActivityData>, status: OnlineStatus) {
        self.set_activity(activity);
        self.set_status(status);
    }
}

impl fmt::Debug for Shard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shard")
            .field("shard_info", &self.shard_info)
            .field("stage", &self.stage)
            .field("seq", &self.seq)
            .finish_non_exhaustive()
    }
}

/// What the runner must do next, as decided by the state machine.
#[derive(Debug)]
#[non_exhaustive]
pub enum ShardAction {
    Heartbeat,
    Identify,
    Resume,
    Reconnect(ReconnectType),
}

/// The type of reconnection that should be performed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum ReconnectType {
    /// A new connection should be made by sending an identify.
    Reidentify,
    /// A new connection should be made by sending a resume.
    Resume,
}

/// The verdict of [`Shard::check_heartbeat`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HeartbeatStatus {
    /// The interval has not elapsed.
    NotDue,
    /// Send a heartbeat now.
    Due,
    /// The last heartbeat was never acknowledged; the connection is dead
    /// even though the socket looks open.
    Zombie,
}

/// Indicates the current connection stage of a [`Shard`].
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[non_exhaustive]
pub enum ConnectionStage {
    /// The shard is normally connected, processing events.
    Connected,
    /// The shard is opening a transport connection.
    Connecting,
    /// The shard is fully disconnected and not in a reconnecting phase.
    Disconnected,
    /// The transport is open and the shard awaits the initial Hello.
    Handshake,
    /// An identify has been sent; awaiting Ready.
    Identifying,
    /// A resume has been sent; awaiting Resumed.
    Resuming,
}

impl ConnectionStage {
    /// Whether the stage is a form of connecting.
    #[must_use]
    pub fn is_connecting(self) -> bool {
        use self::ConnectionStage::{Connecting, Handshake, Identifying, Resuming};
        matches!(self, Connecting | Handshake | Identifying | Resuming)
    }
}

impl fmt::Display for ConnectionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match *self {
            Self::Connected => "connected",
            Self::Connecting => "connecting",
            Self::Disconnected => "disconnected",
            Self::Handshake => "handshaking",
            Self::Identifying => "identifying",
            Self::Resuming => "resuming",
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::time::Instant;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;

    use super::{ConnectionStage, HeartbeatStatus, ReconnectType, Shard, ShardAction};
    use crate::gateway::GatewayError;
    use crate::model::event::{Event, GatewayEvent};
    use crate::model::gateway::ShardInfo;
    use crate::model::id::ShardId;
    use crate::Error;

    fn shard() -> Shard {
        let mut shard = Shard::new(ShardInfo::new(ShardId(0), 1), None);
        shard.set_connecting();
        shard.set_handshake(Instant::now());
        shard
    }

    fn close_frame(code: u16) -> CloseFrame<'static> {
        CloseFrame {
            code: CloseCode::from(code),
            reason: "".into(),
        }
    }

    fn ready_event() -> GatewayEvent {
        GatewayEvent::Dispatch {
            seq: 1,
            event: Event::decode(
                "READY",
                json!({
                    "v": 10,
                    "user": {"id": "1", "username": "bot"},
                    "session_id": "deadbeef",
                    "resume_gateway_url": "wss://resume.example",
                    "guilds": [],
                }),
            ),
        }
    }

    #[test]
    fn hello_during_handshake_identifies() {
        let mut shard = shard();
        let now = Instant::now();

        let (action, event) = shard.handle_event(
            GatewayEvent::Hello {
                heartbeat_interval: 41250,
            },
            now,
        );

        assert!(matches!(action, Some(ShardAction::Identify)));
        assert!(event.is_none());
        assert_eq!(shard.heartbeat_interval(), Some(Duration::from_millis(41250)));
        // First beat lands somewhere inside one jittered interval.
        assert_eq!(shard.check_heartbeat(now), HeartbeatStatus::NotDue);
        assert_ne!(
            shard.check_heartbeat(now + Duration::from_millis(41251)),
            HeartbeatStatus::NotDue
        );
    }

    #[test]
    fn hello_with_live_session_resumes() {
        let mut shard = shard();
        let now = Instant::now();
        shard.handle_event(ready_event(), now);

        shard.set_connecting();
        shard.set_handshake(now);
        let (action, _) = shard.handle_event(
            GatewayEvent::Hello {
                heartbeat_interval: 41250,
            },
            now,
        );

        assert!(matches!(action, Some(ShardAction::Resume)));
    }

    #[test]
    fn ready_stores_the_session() {
        let mut shard = shard();
        shard.handle_event(ready_event(), Instant::now());

        assert_eq!(shard.stage(), ConnectionStage::Connected);
        assert_eq!(shard.session_id(), Some("deadbeef"));
        assert_eq!(shard.resume_ws_url(), Some("wss://resume.example"));
        assert_eq!(shard.seq(), 1);
    }

    #[test]
    fn sequence_is_recorded_even_for_unknown_events() {
        let mut shard = shard();
        shard.handle_event(
            GatewayEvent::Dispatch {
                seq: 7,
                event: Event::decode("SOME_NEW_THING", json!({})),
            },
            Instant::now(),
        );

        assert_eq!(shard.seq(), 7);
    }

    #[test]
    fn session_survives_a_resumable_invalidation() {
        let mut shard = shard();
        let now = Instant::now();
        shard.handle_event(ready_event(), now);
        shard.handle_event(
            GatewayEvent::Dispatch {
                seq: 9,
                event: Event::decode("SOME_NEW_THING", json!({})),
            },
            now,
        );

        let (action, _) =
            shard.handle_event(GatewayEvent::InvalidateSession { resumable: true }, now);
        assert!(matches!(action, Some(ShardAction::Reconnect(ReconnectType::Resume))));
        assert_eq!(shard.seq(), 9);
        assert_eq!(shard.session_id(), Some("deadbeef"));
    }

    #[test]
    fn non_resumable_invalidation_clears_the_session() {
        let mut shard = shard();
        let now = Instant::now();
        shard.handle_event(ready_event(), now);

        let (action, _) =
            shard.handle_event(GatewayEvent::InvalidateSession { resumable: false }, now);
        assert!(matches!(action, Some(ShardAction::Reconnect(ReconnectType::Reidentify))));
        assert_eq!(shard.seq(), 0);
        assert!(shard.session_id().is_none());
    }

    #[test]
    fn unacknowledged_heartbeat_goes_zombie() {
        let mut shard = shard();
        let now = Instant::now();
        shard.handle_event(
            GatewayEvent::Hello {
                heartbeat_interval: 1000,
            },
            now,
        );

        shard.heartbeat_sent(now);
        let after = now + Duration::from_millis(1001);

        // No ack: zombie.
        assert_eq!(shard.check_heartbeat(after), HeartbeatStatus::Zombie);

        // Acked: just due again.
        shard.handle_event(GatewayEvent::HeartbeatAck, now + Duration::from_millis(50));
        assert_eq!(shard.check_heartbeat(after), HeartbeatStatus::Due);
        assert_eq!(shard.latency(), Some(Duration::from_millis(50)));
    }

    #[test]
    fn missing_hello_goes_zombie_eventually() {
        let shard = shard();
        let now = Instant::now();

        assert_eq!(shard.check_heartbeat(now + Duration::from_secs(1)), HeartbeatStatus::NotDue);
        assert_eq!(shard.check_heartbeat(now + Duration::from_secs(16)), HeartbeatStatus::Zombie);
    }

    #[test]
    fn authentication_failure_is_fatal() {
        let mut shard = shard();
        let err = shard.handle_close(Some(&close_frame(4004))).unwrap_err();

        assert!(matches!(err, Error::Gateway(GatewayError::InvalidAuthentication)));
        assert_eq!(shard.stage(), ConnectionStage::Disconnected);
    }

    #[test]
    fn session_timeout_forces_a_reidentify() {
        let mut shard = shard();
        shard.handle_event(ready_event(), Instant::now());

        let action = shard.handle_close(Some(&close_frame(4009))).unwrap();
        assert!(matches!(action, ShardAction::Reconnect(ReconnectType::Reidentify)));
        assert!(shard.session_id().is_none());
        assert_eq!(shard.seq(), 0);
    }

    #[test]
    fn transient_close_resumes_a_live_session() {
        let mut shard = shard();
        shard.handle_event(ready_event(), Instant::now());

        let action = shard.handle_close(Some(&close_frame(4008))).unwrap();
        assert!(matches!(action, ShardAction::Reconnect(ReconnectType::Resume)));
        assert_eq!(shard.session_id(), Some("deadbeef"));
    }
}
