//! The streaming session: lifecycle state machine, feed path, and the
//! encode/send worker.
//!
//! The worker runs on a dedicated OS thread (NOT a tokio task) so the
//! real-time feed path never contends with async network tasks; the feed
//! side hands chunks over a bounded queue with a non-blocking send.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::encoder::{FrameEncoder, new_encoder};
use crate::error::{ConfigError, SessionError, TransportError};
use crate::preprocess::{Preprocessor, new_preprocessor};
use crate::settings::{AudioSettings, StreamFormat, VadKind};
use crate::transport::{StreamTarget, Transport, WsTransport};
use crate::vad::VoiceActivityGate;

/// One streaming slot per process. A second session instance (or a
/// re-entrant start) observes `AlreadyStreaming` until the holder stops.
static STREAMING_SLOT: AtomicBool = AtomicBool::new(false);

/// Depth of the feed queue between the capture path and the worker.
const FEED_QUEUE_DEPTH: usize = 32;

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Configured,
    Streaming,
    Stopped,
}

/// Failures discovered on the worker, reported through the event channel.
/// Never retried; the embedder decides whether to stop and restart.
#[derive(Debug)]
pub enum SessionEvent {
    TransportFailed(TransportError),
    EncodeFailed(anyhow::Error),
}

struct Inner {
    state: SessionState,
    settings: AudioSettings,
    target: StreamTarget,
    gate: VoiceActivityGate,
    preprocessor: Option<Box<dyn Preprocessor>>,
    feed_tx: Option<mpsc::Sender<Vec<i16>>>,
    worker: Option<JoinHandle<Result<(), TransportError>>>,
}

/// The audio-streaming session.
///
/// One constructed instance is shared by whichever components drive the
/// capture loop; all methods take `&self`. Lifecycle operations are
/// serialized on an internal mutex; `feed` shares it but its critical
/// section is bounded (preprocess + gate + queue handoff).
pub struct StreamingSession {
    format: StreamFormat,
    events: mpsc::Sender<SessionEvent>,
    inner: Mutex<Inner>,
}

impl StreamingSession {
    /// Create a session for the given PCM format. Worker-side failures are
    /// posted to `events`.
    pub fn new(format: StreamFormat, events: mpsc::Sender<SessionEvent>) -> Self {
        let gate = VoiceActivityGate::new(format.sample_rate);
        Self {
            format,
            events,
            inner: Mutex::new(Inner {
                state: SessionState::Idle,
                settings: AudioSettings::default(),
                target: StreamTarget::default(),
                gate,
                preprocessor: None,
                feed_tx: None,
                worker: None,
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    /// Validate and store settings and target for the next streaming cycle.
    pub fn configure(
        &self,
        settings: AudioSettings,
        room: &str,
        account_id: &str,
        url: &str,
    ) -> Result<(), ConfigError> {
        validate_settings(&settings)?;

        let mut inner = self.lock();
        if inner.state == SessionState::Streaming {
            return Err(ConfigError::SessionActive);
        }
        inner.settings = settings;
        inner.target = StreamTarget {
            room: room.to_string(),
            account_id: account_id.to_string(),
            url: url.to_string(),
        };
        inner.state = SessionState::Configured;
        log::info!(
            "Session configured: room=\"{}\", account=\"{}\", url={}, codec={}",
            inner.target.room,
            inner.target.account_id,
            inner.target.url,
            inner.settings.codec.wire_name(),
        );
        Ok(())
    }

    /// Start streaming with capabilities built from the stored settings
    /// (built-in Opus encoder and websocket transport).
    pub fn start(&self) -> Result<(), SessionError> {
        let settings = {
            let inner = self.lock();
            match inner.state {
                SessionState::Streaming => return Err(SessionError::AlreadyStreaming),
                SessionState::Configured => {}
                _ => return Err(SessionError::NotConfigured),
            }
            inner.settings.clone()
        };
        let encoder = new_encoder(&settings, &self.format).map_err(SessionError::Codec)?;
        self.start_with(encoder, Box::new(WsTransport::new()))
    }

    /// Start streaming with caller-supplied encoder and transport
    /// capabilities (external codecs, tests).
    pub fn start_with(
        &self,
        encoder: Box<dyn FrameEncoder>,
        mut transport: Box<dyn Transport>,
    ) -> Result<(), SessionError> {
        let mut inner = self.lock();
        match inner.state {
            SessionState::Streaming => return Err(SessionError::AlreadyStreaming),
            SessionState::Configured => {}
            _ => return Err(SessionError::NotConfigured),
        }
        if STREAMING_SLOT
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SessionError::AlreadyStreaming);
        }

        if let Err(e) = transport.connect(&inner.target, &inner.settings, &self.format) {
            STREAMING_SLOT.store(false, Ordering::SeqCst);
            return Err(SessionError::Transport(e));
        }

        inner.gate.reset();
        let preprocessor = inner
            .settings
            .enable_preprocessor
            .then(|| new_preprocessor(&inner.settings, &self.format));
        inner.preprocessor = preprocessor;

        let (feed_tx, feed_rx) = mpsc::channel::<Vec<i16>>(FEED_QUEUE_DEPTH);
        let settings = inner.settings.clone();
        let events = self.events.clone();
        let worker = thread::Builder::new()
            .name("stream-worker".into())
            .spawn(move || worker_loop(settings, encoder, transport, feed_rx, events));
        let worker = match worker {
            Ok(handle) => handle,
            Err(e) => {
                STREAMING_SLOT.store(false, Ordering::SeqCst);
                inner.preprocessor = None;
                return Err(SessionError::Worker(e));
            }
        };

        inner.feed_tx = Some(feed_tx);
        inner.worker = Some(worker);
        inner.state = SessionState::Streaming;
        log::info!("Streaming started");
        Ok(())
    }

    /// Assert or release the push-to-talk toggle (`TransmitType::Toggle`).
    pub fn set_transmit_toggle(&self, on: bool) {
        self.lock().gate.set_toggle(on);
    }

    /// Run one captured PCM chunk through the gate and, if it is open, hand
    /// it to the encode/send worker. Returns after the handoff, not after
    /// the data reaches the network.
    pub fn feed(&self, pcm: &[i16]) -> Result<(), SessionError> {
        let mut inner = self.lock();
        let inner = &mut *inner;
        if inner.state != SessionState::Streaming {
            return Err(SessionError::NotStreaming);
        }
        if pcm.is_empty() {
            return Ok(());
        }

        let mut chunk = pcm.to_vec();
        if let Some(pp) = inner.preprocessor.as_mut() {
            pp.process(&mut chunk);
        }

        let level = match inner.settings.vad_kind {
            VadKind::Amplitude => VoiceActivityGate::peak_amplitude(&chunk),
            // Without a preprocessor there is no SNR estimate; fall back to
            // amplitude.
            VadKind::SignalToNoise => inner
                .preprocessor
                .as_ref()
                .map(|pp| pp.speech_probability())
                .unwrap_or_else(|| VoiceActivityGate::peak_amplitude(&chunk)),
        };

        let frames = chunk.len() / self.format.channels.max(1) as usize;
        let settings = &inner.settings;
        let open = inner.gate.update(level, frames, settings);
        if inner.settings.audio_mixer_debug {
            log::debug!("feed: {} samples, level={:.3}, gate={}", chunk.len(), level, open);
        }

        let outgoing = if open {
            chunk
        } else if inner.settings.enable_comfort_noise {
            VoiceActivityGate::comfort_fill(chunk.len(), inner.settings.comfort_noise_level)
        } else {
            return Ok(());
        };

        if let Some(tx) = inner.feed_tx.as_ref() {
            match tx.try_send(outgoing) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    // The capture path must not block; drop the chunk.
                    log::warn!("Feed queue full, dropping {} samples", pcm.len());
                }
                Err(TrySendError::Closed(_)) => {
                    log::warn!("Feed queue closed, dropping {} samples", pcm.len());
                }
            }
        }
        Ok(())
    }

    /// Stop streaming: drain and join the worker (which flushes the encoder
    /// and closes the transport), then release the streaming slot.
    /// Idempotent when not streaming.
    pub fn stop(&self) -> Result<(), SessionError> {
        let mut inner = self.lock();
        if inner.state != SessionState::Streaming {
            return Ok(());
        }

        // Dropping the sender closes the queue; the worker drains what is
        // left and exits.
        inner.feed_tx = None;
        let close_result = match inner.worker.take() {
            Some(handle) => match handle.join() {
                Ok(res) => res,
                Err(_) => {
                    log::error!("Stream worker panicked");
                    Ok(())
                }
            },
            None => Ok(()),
        };

        inner.preprocessor = None;
        inner.state = SessionState::Stopped;
        STREAMING_SLOT.store(false, Ordering::SeqCst);
        log::info!("Streaming stopped");

        // The session is safely Stopped either way; a close failure is still
        // the caller's to see.
        close_result.map_err(SessionError::Transport)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for StreamingSession {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn validate_settings(settings: &AudioSettings) -> Result<(), ConfigError> {
    if settings.vad_min > settings.vad_max {
        return Err(ConfigError::InvalidRange("vad_min must not exceed vad_max"));
    }
    if settings.vad_kind == VadKind::Amplitude
        && !(0.0..=1.0).contains(&settings.vad_min)
    {
        return Err(ConfigError::InvalidRange("vad_min must be within [0, 1]"));
    }
    if settings.vad_kind == VadKind::Amplitude
        && !(0.0..=1.0).contains(&settings.vad_max)
    {
        return Err(ConfigError::InvalidRange("vad_max must be within [0, 1]"));
    }
    if settings.quality <= 0 {
        return Err(ConfigError::InvalidRange("quality must be positive"));
    }
    if settings.audio_per_packet < 1 {
        return Err(ConfigError::InvalidRange("audio_per_packet must be at least 1"));
    }
    Ok(())
}

// ======================== Worker ========================

fn worker_loop(
    settings: AudioSettings,
    mut encoder: Box<dyn FrameEncoder>,
    mut transport: Box<dyn Transport>,
    mut feed_rx: mpsc::Receiver<Vec<i16>>,
    events: mpsc::Sender<SessionEvent>,
) -> Result<(), TransportError> {
    let frame_samples = encoder.frame_samples();
    let frames_per_packet = settings.audio_per_packet.max(1);

    // Accumulation buffer for PCM samples (i16)
    let mut accum: Vec<i16> = Vec::with_capacity(frame_samples * 2);
    // Encoded frames bundled into the current packet
    let mut packet: Vec<u8> = Vec::new();
    let mut frames_in_packet: u32 = 0;

    log::info!(
        "Worker started: frame_samples={}, frames_per_packet={}",
        frame_samples,
        frames_per_packet,
    );

    while let Some(chunk) = feed_rx.blocking_recv() {
        accum.extend_from_slice(&chunk);

        // Encode complete frames
        while accum.len() >= frame_samples {
            match encoder.encode(&accum[..frame_samples]) {
                Ok(data) if !data.is_empty() => {
                    packet.extend_from_slice(&data);
                    frames_in_packet += 1;
                    if frames_in_packet >= frames_per_packet {
                        if let Err(e) = transport.send(&packet) {
                            log::warn!("Packet send failed: {}", e);
                            let _ = events.try_send(SessionEvent::TransportFailed(e));
                        }
                        packet.clear();
                        frames_in_packet = 0;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    log::error!("Encode error: {}", e);
                    let _ = events.try_send(SessionEvent::EncodeFailed(e));
                }
            }
            accum.drain(..frame_samples);
        }
    }

    // Queue closed: flush codec state and any partially-bundled packet.
    // A trailing partial frame in `accum` cannot be encoded and is dropped.
    match encoder.flush() {
        Ok(Some(data)) => packet.extend_from_slice(&data),
        Ok(None) => {}
        Err(e) => {
            log::error!("Encoder flush error: {}", e);
            let _ = events.try_send(SessionEvent::EncodeFailed(e));
        }
    }
    if !packet.is_empty() {
        if let Err(e) = transport.send(&packet) {
            log::warn!("Final packet send failed: {}", e);
            let _ = events.try_send(SessionEvent::TransportFailed(e));
        }
    }

    log::info!("Worker stopped");
    transport.close()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::CodecFormat;

    fn session() -> (StreamingSession, mpsc::Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel(16);
        (StreamingSession::new(StreamFormat::default(), tx), rx)
    }

    #[test]
    fn configure_rejects_inverted_vad_band() {
        let (session, _rx) = session();
        let settings = AudioSettings {
            vad_min: 0.7,
            vad_max: 0.2,
            ..AudioSettings::default()
        };
        assert!(matches!(
            session.configure(settings, "r", "a", "wss://x"),
            Err(ConfigError::InvalidRange(_))
        ));
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn configure_rejects_out_of_range_amplitude_thresholds() {
        let (session, _rx) = session();
        let settings = AudioSettings {
            vad_min: -0.1,
            ..AudioSettings::default()
        };
        assert!(session.configure(settings, "r", "a", "wss://x").is_err());

        let settings = AudioSettings {
            vad_max: 1.5,
            ..AudioSettings::default()
        };
        assert!(session.configure(settings, "r", "a", "wss://x").is_err());

        // SNR thresholds are not bounded to [0,1]
        let settings = AudioSettings {
            vad_kind: VadKind::SignalToNoise,
            vad_min: 1.2,
            vad_max: 4.0,
            ..AudioSettings::default()
        };
        assert!(session.configure(settings, "r", "a", "wss://x").is_ok());
    }

    #[test]
    fn configure_rejects_bad_quality_and_packet_count() {
        let (session, _rx) = session();
        let settings = AudioSettings {
            quality: 0,
            ..AudioSettings::default()
        };
        assert!(matches!(
            session.configure(settings, "r", "a", "wss://x"),
            Err(ConfigError::InvalidRange(_))
        ));

        let settings = AudioSettings {
            audio_per_packet: 0,
            ..AudioSettings::default()
        };
        assert!(matches!(
            session.configure(settings, "r", "a", "wss://x"),
            Err(ConfigError::InvalidRange(_))
        ));
    }

    #[test]
    fn feed_before_start_is_rejected() {
        let (session, _rx) = session();
        let buf = vec![0i16; 480];
        assert!(matches!(session.feed(&buf), Err(SessionError::NotStreaming)));

        session
            .configure(AudioSettings::default(), "r", "a", "wss://x")
            .unwrap();
        assert!(matches!(session.feed(&buf), Err(SessionError::NotStreaming)));
    }

    #[test]
    fn start_unconfigured_is_rejected() {
        let (session, _rx) = session();
        assert!(matches!(session.start(), Err(SessionError::NotConfigured)));
    }

    #[test]
    fn start_reports_missing_codec() {
        let (session, _rx) = session();
        let settings = AudioSettings {
            codec: CodecFormat::Celt,
            ..AudioSettings::default()
        };
        session.configure(settings, "r", "a", "wss://x").unwrap();
        assert!(matches!(session.start(), Err(SessionError::Codec(_))));
        // Failed start leaves the session Configured.
        assert_eq!(session.state(), SessionState::Configured);
    }

    #[test]
    fn stop_is_idempotent_outside_streaming() {
        let (session, _rx) = session();
        assert!(session.stop().is_ok());
        assert!(session.stop().is_ok());
        assert_eq!(session.state(), SessionState::Idle);

        session
            .configure(AudioSettings::default(), "r", "a", "wss://x")
            .unwrap();
        assert!(session.stop().is_ok());
        assert_eq!(session.state(), SessionState::Configured);
    }
}
