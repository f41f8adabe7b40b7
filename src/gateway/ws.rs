use std::env::consts;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace, warn};
use url::Url;

use super::{ChunkGuildFilter, GatewayError, PresenceData};
use crate::constants::{self, Opcode};
use crate::model::event::GatewayEvent;
use crate::model::gateway::ShardInfo;
use crate::model::id::{ChannelId, GuildId};
use crate::{Error, Result};

pub struct WsClient(WebSocketStream<MaybeTlsStream<TcpStream>>);

const TIMEOUT: Duration = Duration::from_millis(500);

impl WsClient {
    pub(crate) async fn connect(url: &Url) -> Result<Self> {
        let config = WebSocketConfig {
            max_message_size: None,
            max_frame_size: None,
            ..Default::default()
        };
        let (stream, _) = connect_async_with_config(url.as_str(), Some(config), false).await?;

        Ok(Self(stream))
    }

    /// Receives one frame as raw JSON, waiting at most 500ms so callers can
    /// interleave channel and timer work.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Closed`] when the peer closed the connection,
    /// and [`Error::Tungstenite`] on transport failure.
    pub(crate) async fn recv_value(&mut self) -> Result<Option<Value>> {
        let message = match timeout(TIMEOUT, self.0.next()).await {
            Ok(Some(Ok(msg))) => msg,
            Ok(Some(Err(e))) => return Err(e.into()),
            // Stream end means the transport is gone; surface it as a close
            // rather than a quiet timeout so the caller reacts immediately.
            Ok(None) => return Err(Error::Gateway(GatewayError::Closed(None))),
            Err(_) => return Ok(None),
        };

        match message {
            Message::Text(payload) => {
                let value = serde_json::from_str(&payload).map_err(|why| {
                    warn!("Err deserializing text: {why:?}; text: {payload}");
                    Error::Json(why)
                })?;

                Ok(Some(value))
            },
            // Compression is never negotiated, so a binary frame is a peer
            // misbehaving; dropping it keeps the connection usable.
            Message::Binary(bytes) => {
                warn!("Unexpected binary frame of {} bytes", bytes.len());

                Ok(None)
            },
            Message::Close(frame) => Err(Error::Gateway(GatewayError::Closed(frame))),
            _ => Ok(None),
        }
    }

    pub(crate) async fn recv_json(&mut self) -> Result<Option<GatewayEvent>> {
        match self.recv_value().await? {
            Some(value) => GatewayEvent::decode(value).map(Some),
            None => Ok(None),
        }
    }

    pub(crate) async fn send_json(&mut self, value: &Value) -> Result<()> {
        let message = serde_json::to_string(value).map(Message::Text)?;

        self.0.send(message).await?;
        Ok(())
    }

    /// Delegate to `SinkExt::send`.
    pub(crate) async fn send(&mut self, message: Message) -> Result<()> {
        self.0.send(message).await?;
        Ok(())
    }

    /// Delegate to `WebSocketStream::close`.
    pub(crate) async fn close(&mut self, msg: Option<CloseFrame<'_>>) -> Result<()> {
        self.0.close(msg).await?;
        Ok(())
    }

    pub(crate) async fn send_heartbeat(
        &mut self,
        shard_info: &ShardInfo,
        seq: Option<u64>,
    ) -> Result<()> {
        trace!("{shard_info} Sending heartbeat d: {seq:?}");

        self.send_json(&json!({
            "op": Opcode::Heartbeat.num(),
            "d": seq,
        }))
        .await
    }

    pub(crate) async fn send_identify(
        &mut self,
        shard_info: &ShardInfo,
        token: &str,
        presence: &PresenceData,
    ) -> Result<()> {
        debug!("{shard_info} Identifying");

        self.send_json(&json!({
            "op": Opcode::Identify.num(),
            "d": {
                "compress": false,
                "large_threshold": constants::LARGE_THRESHOLD,
                "shard": [shard_info.id.0, shard_info.total],
                "token": token,
                "v": constants::GATEWAY_VERSION,
                "presence": presence_payload(presence),
                "properties": {
                    "browser": "concord",
                    "device": "concord",
                    "os": consts::OS,
                },
            },
        }))
        .await
    }

    pub(crate) async fn send_resume(
        &mut self,
        shard_info: &ShardInfo,
        session_id: &str,
        seq: u64,
        token: &str,
    ) -> Result<()> {
        debug!("{shard_info} Sending resume; seq: {seq}");

        self.send_json(&json!({
            "op": Opcode::Resume.num(),
            "d": {
                "session_id": session_id,
                "seq": seq,
                "token": token,
            },
        }))
        .await
    }

    pub(crate) async fn send_presence_update(
        &mut self,
        shard_info: &ShardInfo,
        presence: &PresenceData,
    ) -> Result<()> {
        debug!("{shard_info} Sending presence update");

        self.send_json(&json!({
            "op": Opcode::PresenceUpdate.num(),
            "d": presence_payload(presence),
        }))
        .await
    }

    pub(crate) async fn send_chunk_guild(
        &mut self,
        guild_id: GuildId,
        shard_info: &ShardInfo,
        limit: Option<u16>,
        filter: ChunkGuildFilter,
        nonce: Option<&str>,
    ) -> Result<()> {
        debug!("{shard_info} Requesting member chunks for {guild_id}");

        let mut payload = json!({
            "op": Opcode::RequestGuildMembers.num(),
            "d": {
                "guild_id": guild_id.to_string(),
                "limit": limit.unwrap_or(0),
                "nonce": nonce.unwrap_or(""),
            },
        });

        match filter {
            ChunkGuildFilter::None => payload["d"]["query"] = json!(""),
            ChunkGuildFilter::Query(query) => payload["d"]["query"] = json!(query),
            ChunkGuildFilter::UserIds(user_ids) => {
                let ids = user_ids.iter().map(|x| x.get()).collect::<Vec<u64>>();
                payload["d"]["user_ids"] = json!(ids);
            },
        };

        self.send_json(&payload).await
    }

    pub(crate) async fn send_voice_state_update(
        &mut self,
        shard_info: &ShardInfo,
        guild_id: GuildId,
        channel_id: Option<ChannelId>,
        self_mute: bool,
        self_deaf: bool,
    ) -> Result<()> {
        debug!("{shard_info} Updating voice state in {guild_id}");

        self.send_json(&json!({
            "op": Opcode::VoiceStateUpdate.num(),
            "d": {
                "guild_id": guild_id.to_string(),
                "channel_id": channel_id.map(|id| id.to_string()),
                "self_mute": self_mute,
                "self_deaf": self_deaf,
            },
        }))
        .await
    }
}

fn presence_payload(presence: &PresenceData) -> Value {
    json!({
        "afk": false,
        "since": Value::Null,
        "status": presence.status.name(),
        "activities": presence.activity.as_ref().map_or_else(Vec::new, |activity| {
            vec![json!({
                "name": activity.name,
                "type": activity.kind,
                "url": activity.url,
            })]
        }),
    })
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;
    use url::Url;

    use super::WsClient;
    use crate::gateway::GatewayError;
    use crate::Error;

    #[tokio::test]
    async fn an_ended_stream_surfaces_as_a_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut server = accept_async(socket).await.unwrap();
            server.close(None).await.unwrap();
            while let Some(Ok(_)) = server.next().await {}
        });

        let url = Url::parse(&format!("ws://{addr}")).unwrap();
        let mut client = WsClient::connect(&url).await.unwrap();

        // The close frame itself.
        assert!(matches!(
            client.recv_value().await,
            Err(Error::Gateway(GatewayError::Closed(_)))
        ));

        // The stream has ended; that must keep reading as a close, not as a
        // quiet timeout.
        assert!(matches!(
            client.recv_value().await,
            Err(Error::Gateway(GatewayError::Closed(None)))
        ));
    }
}
