//! Transport capability: broadcast endpoint addressing, the transport trait,
//! and the built-in websocket implementation.

use bytes::Bytes;
use futures_util::SinkExt;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;
use uuid::Uuid;

use crate::error::TransportError;
use crate::settings::{AudioSettings, StreamFormat};

/// Broadcast destination: room and account on a given endpoint URL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamTarget {
    pub room: String,
    pub account_id: String,
    pub url: String,
}

/// Connection to the broadcast endpoint, accepting encoded audio packets.
///
/// Implementations are driven from the session's worker thread; calls are
/// never concurrent.
pub trait Transport: Send {
    /// Open the connection and announce the stream parameters.
    fn connect(
        &mut self,
        target: &StreamTarget,
        settings: &AudioSettings,
        format: &StreamFormat,
    ) -> Result<(), TransportError>;

    /// Transmit one encoded packet.
    fn send(&mut self, packet: &[u8]) -> Result<(), TransportError>;

    /// Close the connection. Safe to call when already closed.
    fn close(&mut self) -> Result<(), TransportError>;
}

// ======================== Hello message ========================

// 音频参数结构体
#[derive(Serialize)]
struct AudioParams {
    format: &'static str,
    sample_rate: u32,
    channels: u32,
    frame_duration: u32,
    bitrate: i32,
    frames_per_packet: u32,
}

// Playback tunables are opaque to this core; the receiving end interprets them.
#[derive(Serialize)]
struct PlaybackParams {
    jitter_buffer_size: i32,
    output_delay: i32,
    volume: f32,
    prefer_receiver_over_speaker: bool,
}

// Hello Message，用于初始化连接
#[derive(Serialize)]
struct HelloMessage<'a> {
    #[serde(rename = "type")]
    msg_type: &'static str,
    version: u8,
    transport: &'static str,
    room: &'a str,
    account_id: &'a str,
    audio_params: AudioParams,
    playback: PlaybackParams,
}

impl<'a> HelloMessage<'a> {
    fn new(target: &'a StreamTarget, settings: &AudioSettings, format: &StreamFormat) -> Self {
        Self {
            msg_type: "hello",
            version: 1,
            transport: "websocket",
            room: &target.room,
            account_id: &target.account_id,
            audio_params: AudioParams {
                format: settings.codec.wire_name(),
                sample_rate: format.sample_rate,
                channels: format.channels,
                frame_duration: format.frame_duration_ms,
                bitrate: settings.quality,
                frames_per_packet: settings.audio_per_packet,
            },
            playback: PlaybackParams {
                jitter_buffer_size: settings.jitter_buffer_size,
                output_delay: settings.output_delay,
                volume: settings.volume,
                prefer_receiver_over_speaker: settings.prefer_receiver_over_speaker,
            },
        }
    }
}

// ======================== Websocket transport ========================

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Websocket transport to the broadcast endpoint.
///
/// Owns a current-thread tokio runtime so the synchronous trait calls can
/// drive the async websocket from the session worker. Must be called from
/// outside an async runtime (the capture thread or the worker), never from
/// a tokio task.
pub struct WsTransport {
    client_id: String,
    runtime: Option<tokio::runtime::Runtime>,
    stream: Option<WsStream>,
}

impl WsTransport {
    pub fn new() -> Self {
        Self {
            client_id: Uuid::new_v4().to_string(),
            runtime: None,
            stream: None,
        }
    }
}

impl Default for WsTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for WsTransport {
    fn connect(
        &mut self,
        target: &StreamTarget,
        settings: &AudioSettings,
        format: &StreamFormat,
    ) -> Result<(), TransportError> {
        let fail = |source: anyhow::Error| TransportError::Connect {
            url: target.url.clone(),
            source,
        };

        let url = Url::parse(&target.url).map_err(|e| fail(e.into()))?;
        let host = url.host_str().unwrap_or_default().to_string();

        let request = tokio_tungstenite::tungstenite::http::Request::builder()
            .method("GET")
            .uri(&target.url)
            .header("Host", host)
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Version", "13")
            .header(
                "Sec-WebSocket-Key",
                tokio_tungstenite::tungstenite::handshake::client::generate_key(),
            )
            .header("X-Room", &target.room)
            .header("X-Account-Id", &target.account_id)
            .header("Client-Id", &self.client_id)
            .header("Protocol-Version", "1")
            .body(())
            .map_err(|e| fail(e.into()))?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| fail(e.into()))?;

        log::info!("Connecting to {}...", target.url);
        let mut stream = runtime
            .block_on(async {
                let (ws_stream, _) = connect_async(request).await?;
                Ok::<_, tokio_tungstenite::tungstenite::Error>(ws_stream)
            })
            .map_err(|e| fail(e.into()))?;

        let hello = HelloMessage::new(target, settings, format);
        let hello_json = serde_json::to_string(&hello).map_err(|e| fail(e.into()))?;
        log::info!("Connected, sending hello for room \"{}\"", target.room);
        runtime
            .block_on(stream.send(Message::Text(hello_json.into())))
            .map_err(|e| fail(e.into()))?;

        self.runtime = Some(runtime);
        self.stream = Some(stream);
        Ok(())
    }

    fn send(&mut self, packet: &[u8]) -> Result<(), TransportError> {
        let (runtime, stream) = match (self.runtime.as_ref(), self.stream.as_mut()) {
            (Some(rt), Some(st)) => (rt, st),
            _ => return Err(TransportError::Closed),
        };
        let data = Bytes::copy_from_slice(packet);
        runtime
            .block_on(stream.send(Message::Binary(data)))
            .map_err(|e| TransportError::Send(e.into()))
    }

    fn close(&mut self) -> Result<(), TransportError> {
        let Some(runtime) = self.runtime.take() else {
            return Ok(());
        };
        if let Some(mut stream) = self.stream.take() {
            // The server may have initiated its own close already.
            if let Err(e) = runtime.block_on(stream.close(None)) {
                log::debug!("Websocket close: {}", e);
            }
        }
        log::info!("Transport closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_message_carries_target_and_audio_params() {
        let target = StreamTarget {
            room: "r1".into(),
            account_id: "a1".into(),
            url: "wss://x".into(),
        };
        let settings = AudioSettings::default();
        let format = StreamFormat::default();

        let hello = HelloMessage::new(&target, &settings, &format);
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&hello).unwrap()).unwrap();

        assert_eq!(json["type"], "hello");
        assert_eq!(json["room"], "r1");
        assert_eq!(json["account_id"], "a1");
        assert_eq!(json["audio_params"]["format"], "opus");
        assert_eq!(json["audio_params"]["sample_rate"], 48000);
        assert_eq!(json["audio_params"]["bitrate"], 72000);
        assert_eq!(json["playback"]["jitter_buffer_size"], 0);
        assert_eq!(json["playback"]["prefer_receiver_over_speaker"], true);
    }

    #[test]
    fn send_on_unopened_transport_reports_closed() {
        let mut transport = WsTransport::new();
        assert!(matches!(
            transport.send(&[1, 2, 3]),
            Err(TransportError::Closed)
        ));
        // close is idempotent even when never connected
        assert!(transport.close().is_ok());
    }
}
