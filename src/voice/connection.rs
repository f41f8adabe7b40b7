use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration, Instant};
use tracing::{debug, trace, warn};
use url::Url;

use super::VoiceError;
use crate::constants::{self, VoiceOpcode};
use crate::gateway::WsClient;
use crate::model::id::{ChannelId, GuildId, UserId};
use crate::{Error, Result};

/// How long a join waits for the gateway to relay session credentials.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// The lifecycle stage of a voice connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VoiceConnectionStage {
    /// No live session; the state after creation, invalidation, or a fatal
    /// signaling failure.
    Idle,
    /// Waiting for credentials or for the signaling handshake to finish.
    Connecting,
    /// The signaling channel is up and nothing is playing.
    Ready,
    Playing,
    Paused,
}

/// The guild's voice server credentials, relayed over the primary gateway.
#[derive(Clone, Debug)]
struct VoiceServer {
    token: String,
    endpoint: String,
}

/// An opaque handle naming the media resource a connection plays.
///
/// The media path itself (encode, encrypt, transmit) sits behind this
/// boundary and is not modeled here.
#[derive(Clone, Debug)]
pub struct AudioResource {
    pub name: String,
}

impl AudioResource {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Elapsed play time for the current resource, excluding paused intervals.
#[derive(Debug, Default)]
pub(super) struct Playback {
    accumulated: Duration,
    segment_start: Option<Instant>,
}

impl Playback {
    pub(super) fn start(&mut self, now: Instant) {
        self.accumulated = Duration::ZERO;
        self.segment_start = Some(now);
    }

    pub(super) fn pause(&mut self, now: Instant) {
        if let Some(start) = self.segment_start.take() {
            self.accumulated += now.saturating_duration_since(start);
        }
    }

    pub(super) fn resume(&mut self, now: Instant) {
        if self.segment_start.is_none() {
            self.segment_start = Some(now);
        }
    }

    pub(super) fn stop(&mut self) {
        self.accumulated = Duration::ZERO;
        self.segment_start = None;
    }

    pub(super) fn position(&self, now: Instant) -> Duration {
        match self.segment_start {
            Some(start) => self.accumulated + now.saturating_duration_since(start),
            None => self.accumulated,
        }
    }
}

/// One guild's voice session.
///
/// Joining rides the primary gateway: a voice-state update goes out over the
/// owning shard, and the session id plus server credentials come back as
/// gateway events. Only then does the connection open its own signaling
/// channel, independent of the shard's.
pub struct VoiceConnection {
    guild_id: GuildId,
    user_id: UserId,
    channel_id: Mutex<Option<ChannelId>>,
    stage: Mutex<VoiceConnectionStage>,
    playback: Mutex<Playback>,
    resource: Mutex<Option<AudioResource>>,
    volume: Mutex<f64>,
    speaking: DashMap<UserId, bool>,
    session_tx: watch::Sender<Option<String>>,
    server_tx: watch::Sender<Option<VoiceServer>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl VoiceConnection {
    pub(super) fn new(guild_id: GuildId, user_id: UserId, channel_id: ChannelId) -> Arc<Self> {
        let (session_tx, _) = watch::channel(None);
        let (server_tx, _) = watch::channel(None);

        Arc::new(Self {
            guild_id,
            user_id,
            channel_id: Mutex::new(Some(channel_id)),
            stage: Mutex::new(VoiceConnectionStage::Connecting),
            playback: Mutex::new(Playback::default()),
            resource: Mutex::new(None),
            volume: Mutex::new(1.0),
            speaking: DashMap::new(),
            session_tx,
            server_tx,
            task: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    #[must_use]
    pub fn channel_id(&self) -> Option<ChannelId> {
        *self.channel_id.lock()
    }

    #[must_use]
    pub fn stage(&self) -> VoiceConnectionStage {
        *self.stage.lock()
    }

    /// Whether the given participant is currently speaking, as reported over
    /// the signaling channel.
    #[must_use]
    pub fn is_speaking(&self, user_id: UserId) -> bool {
        self.speaking.get(&user_id).is_some_and(|s| *s)
    }

    pub(super) fn set_channel(&self, channel_id: ChannelId) {
        *self.channel_id.lock() = Some(channel_id);
    }

    /// Records our own voice state as relayed by the gateway.
    pub(super) fn set_session(&self, session_id: String) {
        self.session_tx.send_replace(Some(session_id));
    }

    /// Records the server credentials as relayed by the gateway.
    pub(super) fn set_server(&self, token: String, endpoint: String) {
        self.server_tx.send_replace(Some(VoiceServer { token, endpoint }));
    }

    /// Waits for the credential pair and opens the signaling channel.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::ConnectionTimeout`] when the gateway does not
    /// relay both halves in time, and [`VoiceError::EndpointInvalid`] when
    /// the advertised endpoint cannot be dialed.
    pub(super) async fn connect(self: &Arc<Self>) -> Result<()> {
        let mut session_rx = self.session_tx.subscribe();
        let mut server_rx = self.server_tx.subscribe();

        let credentials = timeout(CONNECT_TIMEOUT, async {
            let session_id = loop {
                if let Some(session_id) = session_rx.borrow().clone() {
                    break session_id;
                }
                if session_rx.changed().await.is_err() {
                    return None;
                }
            };

            let server = loop {
                if let Some(server) = server_rx.borrow().clone() {
                    break server;
                }
                if server_rx.changed().await.is_err() {
                    return None;
                }
            };

            Some((session_id, server))
        })
        .await;

        let Ok(Some((session_id, server))) = credentials else {
            self.force_idle();
            return Err(Error::Voice(VoiceError::ConnectionTimeout));
        };

        let url = Url::parse(&format!(
            "wss://{}/?v={}",
            server.endpoint.trim_end_matches(":443"),
            constants::VOICE_GATEWAY_VERSION,
        ))
        .map_err(|why| {
            warn!("Invalid voice endpoint `{}`: {why:?}", server.endpoint);
            Error::Voice(VoiceError::EndpointInvalid)
        })?;

        let conn = Arc::clone(self);
        let handle = tokio::spawn(run_signaling(conn, url, session_id, server.token));

        if let Some(old) = self.task.lock().replace(handle) {
            old.abort();
        }

        Ok(())
    }

    /// Starts playing `resource`, replacing any current playback and
    /// resetting the position.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::NotReadyForPlayback`] unless the signaling
    /// handshake has completed.
    pub fn play(&self, resource: AudioResource) -> Result<()> {
        use VoiceConnectionStage::{Paused, Playing, Ready};

        let mut stage = self.stage.lock();
        if !matches!(*stage, Ready | Playing | Paused) {
            return Err(Error::Voice(VoiceError::NotReadyForPlayback));
        }

        debug!("Playing `{}` in {}", resource.name, self.guild_id);

        *stage = Playing;
        self.playback.lock().start(Instant::now());
        *self.resource.lock() = Some(resource);

        Ok(())
    }

    /// Pauses playback, freezing the position. A no-op unless playing.
    pub fn pause(&self) {
        let mut stage = self.stage.lock();
        if *stage == VoiceConnectionStage::Playing {
            *stage = VoiceConnectionStage::Paused;
            self.playback.lock().pause(Instant::now());
        }
    }

    /// Resumes paused playback from the frozen position.
    pub fn resume(&self) {
        let mut stage = self.stage.lock();
        if *stage == VoiceConnectionStage::Paused {
            *stage = VoiceConnectionStage::Playing;
            self.playback.lock().resume(Instant::now());
        }
    }

    /// Stops playback entirely, keeping the session alive.
    pub fn stop_playing(&self) {
        let mut stage = self.stage.lock();
        if matches!(*stage, VoiceConnectionStage::Playing | VoiceConnectionStage::Paused) {
            *stage = VoiceConnectionStage::Ready;
            self.playback.lock().stop();
            *self.resource.lock() = None;
        }
    }

    /// Elapsed play time of the current resource, excluding paused spans.
    #[must_use]
    pub fn position(&self) -> Duration {
        self.playback.lock().position(Instant::now())
    }

    #[must_use]
    pub fn current_resource(&self) -> Option<AudioResource> {
        self.resource.lock().clone()
    }

    /// Sets the playback volume, clamped to `0.0..=2.0`.
    pub fn set_volume(&self, volume: f64) {
        *self.volume.lock() = volume.clamp(0.0, 2.0);
    }

    #[must_use]
    pub fn volume(&self) -> f64 {
        *self.volume.lock()
    }

    /// Tears the connection down to Idle: signaling task aborted, playback
    /// and credentials cleared.
    pub(super) fn invalidate(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }

        self.session_tx.send_replace(None);
        self.server_tx.send_replace(None);
        self.force_idle();
    }

    fn force_idle(&self) {
        *self.stage.lock() = VoiceConnectionStage::Idle;
        self.playback.lock().stop();
        *self.resource.lock() = None;
        self.speaking.clear();
    }

    /// Folds one signaling frame into the connection's state. Returns the
    /// heartbeat interval in milliseconds when the frame was the Hello.
    fn handle_frame(&self, value: &Value) -> Option<u64> {
        let op = value.get("op").and_then(Value::as_u64).and_then(VoiceOpcode::from_num)?;
        let data = value.get("d");

        match op {
            VoiceOpcode::Hello => {
                // Interval arrives as a float of milliseconds.
                let interval_ms = data
                    .and_then(|d| d.get("heartbeat_interval"))
                    .and_then(Value::as_f64)?;

                return Some(interval_ms as u64);
            },
            VoiceOpcode::Ready => {
                debug!("Voice signaling ready in {}", self.guild_id);

                let mut stage = self.stage.lock();
                if *stage == VoiceConnectionStage::Connecting {
                    *stage = VoiceConnectionStage::Ready;
                }
            },
            VoiceOpcode::Speaking => {
                if let Some(data) = data {
                    let user_id = data
                        .get("user_id")
                        .and_then(Value::as_str)
                        .and_then(|s| s.parse().ok())
                        .map(UserId::new);
                    let speaking = data
                        .get("speaking")
                        .and_then(Value::as_u64)
                        .is_some_and(|flags| flags != 0);

                    if let Some(user_id) = user_id {
                        self.speaking.insert(user_id, speaking);
                    }
                }
            },
            VoiceOpcode::SessionDescription => {
                // Media negotiation finished; the media path is out of scope.
                trace!("Voice session description for {}", self.guild_id);
            },
            VoiceOpcode::HeartbeatAck => {
                trace!("Voice heartbeat ack for {}", self.guild_id);
            },
            _ => {},
        }

        None
    }
}

impl std::fmt::Debug for VoiceConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceConnection")
            .field("guild_id", &self.guild_id)
            .field("channel_id", &*self.channel_id.lock())
            .field("stage", &*self.stage.lock())
            .finish_non_exhaustive()
    }
}

/// The signaling loop: identify, heartbeat on the advertised interval, and
/// fold inbound frames into the connection's state.
async fn run_signaling(
    conn: Arc<VoiceConnection>,
    url: Url,
    session_id: String,
    token: String,
) {
    let guild_id = conn.guild_id;

    let mut client = match WsClient::connect(&url).await {
        Ok(client) => client,
        Err(why) => {
            warn!("Failed to open voice signaling for {guild_id}: {why:?}");
            conn.force_idle();
            return;
        },
    };

    let identify = json!({
        "op": VoiceOpcode::Identify.num(),
        "d": {
            "server_id": guild_id.to_string(),
            "user_id": conn.user_id.to_string(),
            "session_id": session_id,
            "token": token,
        },
    });
    if let Err(why) = client.send_json(&identify).await {
        warn!("Failed to identify voice signaling for {guild_id}: {why:?}");
        conn.force_idle();
        return;
    }

    let mut heartbeat_interval: Option<Duration> = None;
    let mut next_heartbeat: Option<Instant> = None;

    loop {
        if let (Some(interval), Some(next)) = (heartbeat_interval, next_heartbeat) {
            if Instant::now() >= next {
                let beat = json!({
                    "op": VoiceOpcode::Heartbeat.num(),
                    "d": epoch_millis(),
                });
                if let Err(why) = client.send_json(&beat).await {
                    debug!("Voice heartbeat failed for {guild_id}: {why:?}");
                    break;
                }
                next_heartbeat = Some(Instant::now() + interval);
            }
        }

        match client.recv_value().await {
            Ok(Some(value)) => {
                if let Some(interval_ms) = conn.handle_frame(&value) {
                    let interval = Duration::from_millis(interval_ms);
                    heartbeat_interval = Some(interval);
                    next_heartbeat = Some(Instant::now() + interval);
                }
            },
            Ok(None) => {},
            Err(why) => {
                debug!("Voice signaling for {guild_id} ended: {why:?}");
                break;
            },
        }
    }

    conn.force_idle();
}

fn epoch_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::time::{Duration, Instant};

    use super::{AudioResource, Playback, VoiceConnection, VoiceConnectionStage};
    use crate::model::id::{ChannelId, GuildId, UserId};
    use crate::voice::VoiceError;
    use crate::Error;

    fn at(base: Instant, secs: u64) -> Instant {
        base + Duration::from_secs(secs)
    }

    #[test]
    fn position_excludes_paused_spans() {
        let base = Instant::now();
        let mut playback = Playback::default();

        playback.start(at(base, 0));
        playback.pause(at(base, 5));
        assert_eq!(playback.position(at(base, 60)), Duration::from_secs(5));

        playback.resume(at(base, 60));
        assert_eq!(playback.position(at(base, 63)), Duration::from_secs(8));

        playback.stop();
        assert_eq!(playback.position(at(base, 99)), Duration::ZERO);
    }

    #[test]
    fn double_pause_and_resume_are_idempotent() {
        let base = Instant::now();
        let mut playback = Playback::default();

        playback.start(at(base, 0));
        playback.pause(at(base, 2));
        playback.pause(at(base, 4));
        assert_eq!(playback.position(at(base, 10)), Duration::from_secs(2));

        playback.resume(at(base, 10));
        playback.resume(at(base, 20));
        assert_eq!(playback.position(at(base, 11)), Duration::from_secs(3));
    }

    #[test]
    fn play_replaces_the_position() {
        let base = Instant::now();
        let mut playback = Playback::default();

        playback.start(at(base, 0));
        playback.start(at(base, 50));
        assert_eq!(playback.position(at(base, 51)), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn playback_requires_a_ready_connection() {
        let conn = VoiceConnection::new(GuildId::new(1), UserId::new(2), ChannelId::new(3));

        // Still connecting; nothing to play over yet.
        let err = conn.play(AudioResource::new("song")).unwrap_err();
        assert!(matches!(err, Error::Voice(VoiceError::NotReadyForPlayback)));

        // Signaling Ready flips the stage and unlocks playback.
        conn.handle_frame(&json!({"op": 2, "d": {"ssrc": 1}}));
        assert_eq!(conn.stage(), VoiceConnectionStage::Ready);

        conn.play(AudioResource::new("song")).unwrap();
        assert_eq!(conn.stage(), VoiceConnectionStage::Playing);

        conn.pause();
        assert_eq!(conn.stage(), VoiceConnectionStage::Paused);
        conn.resume();
        assert_eq!(conn.stage(), VoiceConnectionStage::Playing);

        conn.stop_playing();
        assert_eq!(conn.stage(), VoiceConnectionStage::Ready);
        assert!(conn.current_resource().is_none());
    }

    #[tokio::test]
    async fn speaking_state_tracks_signaling_frames() {
        let conn = VoiceConnection::new(GuildId::new(1), UserId::new(2), ChannelId::new(3));

        conn.handle_frame(&json!({"op": 5, "d": {"user_id": "9", "speaking": 1}}));
        assert!(conn.is_speaking(UserId::new(9)));

        conn.handle_frame(&json!({"op": 5, "d": {"user_id": "9", "speaking": 0}}));
        assert!(!conn.is_speaking(UserId::new(9)));
    }

    #[tokio::test]
    async fn invalidation_forces_idle_and_clears_playback() {
        let conn = VoiceConnection::new(GuildId::new(1), UserId::new(2), ChannelId::new(3));
        conn.handle_frame(&json!({"op": 2, "d": {}}));
        conn.play(AudioResource::new("song")).unwrap();

        conn.invalidate();

        assert_eq!(conn.stage(), VoiceConnectionStage::Idle);
        assert!(conn.current_resource().is_none());
        assert_eq!(conn.position(), Duration::ZERO);
    }

    #[tokio::test]
    async fn hello_yields_the_heartbeat_interval() {
        let conn = VoiceConnection::new(GuildId::new(1), UserId::new(2), ChannelId::new(3));
        let out = conn.handle_frame(&json!({"op": 8, "d": {"heartbeat_interval": 13750.0}}));
        assert_eq!(out, Some(13750));
    }

    #[test]
    fn volume_is_clamped() {
        let conn = VoiceConnection::new(GuildId::new(1), UserId::new(2), ChannelId::new(3));
        conn.set_volume(5.0);
        assert!((conn.volume() - 2.0).abs() < f64::EPSILON);
        conn.set_volume(-1.0);
        assert!(conn.volume() < f64::EPSILON);
    }
}
