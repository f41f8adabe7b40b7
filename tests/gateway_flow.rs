//! Walks a shard through a full connection lifecycle using decoded frames,
//! exercising the public state machine the way a runner would.

use serde_json::json;
use tokio::time::{Duration, Instant};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;

use concord::gateway::{ConnectionStage, HeartbeatStatus, ReconnectType, Shard, ShardAction};
use concord::model::event::GatewayEvent;
use concord::model::gateway::ShardInfo;
use concord::model::id::ShardId;

fn frame(value: serde_json::Value) -> GatewayEvent {
    GatewayEvent::decode(value).expect("decodable frame")
}

fn dispatch(seq: u64, kind: &str, d: serde_json::Value) -> GatewayEvent {
    frame(json!({"op": 0, "s": seq, "t": kind, "d": d}))
}

fn ready(seq: u64) -> GatewayEvent {
    dispatch(
        seq,
        "READY",
        json!({
            "v": 10,
            "user": {"id": "1", "username": "bot"},
            "session_id": "sess-1",
            "resume_gateway_url": "wss://resume.example",
            "guilds": [],
        }),
    )
}

#[tokio::test(start_paused = true)]
async fn connect_heartbeat_and_resume_lifecycle() {
    let mut shard = Shard::new(ShardInfo::new(ShardId(0), 1), None);
    shard.set_connecting();
    shard.set_handshake(Instant::now());

    // Hello during the handshake with no prior session: identify.
    let now = Instant::now();
    let (action, event) = shard.handle_event(frame(json!({"op": 10, "d": {"heartbeat_interval": 41250}})), now);
    assert!(matches!(action, Some(ShardAction::Identify)));
    assert!(event.is_none());
    shard.set_identifying();

    // Ready completes the handshake and stores the session.
    let (action, event) = shard.handle_event(ready(1), now);
    assert!(action.is_none());
    assert!(event.is_some());
    assert_eq!(shard.stage(), ConnectionStage::Connected);
    assert_eq!(shard.session_id(), Some("sess-1"));

    // A full jittered interval later a heartbeat is due; once sent but never
    // acknowledged, the next check declares the connection a zombie.
    let later = now + Duration::from_millis(41251);
    assert_ne!(shard.check_heartbeat(later), HeartbeatStatus::NotDue);
    shard.heartbeat_sent(later);
    let much_later = later + Duration::from_millis(41251);
    assert_eq!(shard.check_heartbeat(much_later), HeartbeatStatus::Zombie);

    // An acknowledgment clears the zombie verdict and yields a latency.
    let ack_at = later + Duration::from_millis(40);
    shard.handle_event(frame(json!({"op": 11})), ack_at);
    assert_eq!(shard.check_heartbeat(much_later), HeartbeatStatus::Due);
    assert_eq!(shard.latency(), Some(Duration::from_millis(40)));

    // Events advance the sequence.
    let (_, _) = shard.handle_event(
        dispatch(2, "MESSAGE_CREATE", json!({
            "id": "5",
            "channel_id": "4",
            "author": {"id": "3", "username": "someone"},
            "content": "hi",
        })),
        much_later,
    );
    assert_eq!(shard.seq(), 2);

    // Losing the transport while Ready with a live session resumes, and the
    // sequence number survives.
    let close = CloseFrame {
        code: CloseCode::from(1006u16),
        reason: "".into(),
    };
    let action = shard.handle_close(Some(&close)).expect("non-fatal close");
    assert!(matches!(action, ShardAction::Reconnect(ReconnectType::Resume)));
    assert_eq!(shard.reconnection_type(), ReconnectType::Resume);
    assert_eq!(shard.seq(), 2);
    assert_eq!(shard.session_id(), Some("sess-1"));
    assert_eq!(shard.resume_ws_url(), Some("wss://resume.example"));

    // On the new transport, Hello while a session is live resumes instead of
    // identifying.
    shard.set_connecting();
    shard.set_handshake(much_later);
    let (action, _) = shard.handle_event(frame(json!({"op": 10, "d": {"heartbeat_interval": 41250}})), much_later);
    assert!(matches!(action, Some(ShardAction::Resume)));
    shard.set_resuming();

    let (action, event) = shard.handle_event(dispatch(3, "RESUMED", json!(null)), much_later);
    assert!(action.is_none());
    assert!(event.is_some());
    assert_eq!(shard.stage(), ConnectionStage::Connected);
    assert_eq!(shard.seq(), 3);
}

#[tokio::test(start_paused = true)]
async fn non_resumable_invalidation_starts_over() {
    let mut shard = Shard::new(ShardInfo::new(ShardId(0), 1), None);
    shard.set_connecting();
    shard.set_handshake(Instant::now());

    let now = Instant::now();
    shard.handle_event(frame(json!({"op": 10, "d": {"heartbeat_interval": 41250}})), now);
    shard.handle_event(ready(8), now);

    let (action, _) = shard.handle_event(frame(json!({"op": 9, "d": false})), now);
    assert!(matches!(action, Some(ShardAction::Reconnect(ReconnectType::Reidentify))));
    assert_eq!(shard.seq(), 0);
    assert!(shard.session_id().is_none());
}
