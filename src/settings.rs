//! Session settings value types.
//!
//! `AudioSettings` is immutable once built and carries every tunable of a
//! streaming cycle. Validation happens at the session configure boundary,
//! not here.

use serde::{Deserialize, Serialize};

/// Encoder selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecFormat {
    Speex,
    Celt,
    Opus,
}

impl CodecFormat {
    /// Format name as used on the wire (hello message).
    pub fn wire_name(self) -> &'static str {
        match self {
            CodecFormat::Speex => "speex",
            CodecFormat::Celt => "celt",
            CodecFormat::Opus => "opus",
        }
    }
}

/// Gating policy for outgoing audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransmitType {
    /// Voice-activity detection with hysteresis.
    Vad,
    /// Push-to-talk: open while the external toggle is asserted.
    Toggle,
    /// Always transmitting.
    Continuous,
}

/// Measurement basis for voice-activity detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VadKind {
    /// Speech-probability estimate from the preprocessor.
    SignalToNoise,
    /// Normalized peak amplitude over the chunk.
    Amplitude,
}

/// Streaming session settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioSettings {
    /// Encoder selection
    pub codec: CodecFormat,
    /// Gating policy for outgoing audio
    pub transmit_type: TransmitType,
    /// VAD measurement basis
    pub vad_kind: VadKind,
    /// Gate close threshold (normalized)
    pub vad_min: f32,
    /// Gate open threshold (normalized)
    pub vad_max: f32,
    /// Target bitrate in bits/s
    pub quality: i32,
    /// Encoded frames bundled per network packet
    pub audio_per_packet: u32,
    /// Noise suppression level in dB (negative)
    pub noise_suppression: i32,
    /// Gain multiplier applied by the preprocessor
    pub amplification: f32,
    /// Playback jitter buffer, 10 ms units (opaque, forwarded to transport)
    pub jitter_buffer_size: i32,
    /// Output volume (opaque, forwarded to transport)
    pub volume: f32,
    /// Artificial output delay, 10 ms units (opaque, forwarded to transport)
    pub output_delay: i32,
    /// Input gain applied before preprocessing
    pub mic_boost: f32,
    /// Enable the signal preprocessor on the feed path
    pub enable_preprocessor: bool,
    /// Echo cancellation on/off (needs a far-end signal; see DESIGN.md)
    pub enable_echo_cancellation: bool,
    /// Substitute comfort noise while the gate is closed
    pub enable_comfort_noise: bool,
    /// Comfort noise amplitude (normalized)
    pub comfort_noise_level: f32,
    /// Keep the gate open for a while after voice stops
    pub enable_vad_gate: bool,
    /// Hangover duration in seconds of feed time
    pub vad_gate_time_seconds: f64,
    /// Output routing preference (opaque, forwarded to transport)
    pub prefer_receiver_over_speaker: bool,
    /// Force Opus into its CELT-compatible low-delay mode
    pub opus_force_celt_mode: bool,
    /// Per-chunk gate decision logging
    pub audio_mixer_debug: bool,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            codec: CodecFormat::Opus,
            transmit_type: TransmitType::Vad,
            vad_kind: VadKind::Amplitude,
            vad_min: 0.3,
            vad_max: 0.6,
            quality: 72000,
            audio_per_packet: 1,
            noise_suppression: -42, /* -42 dB */
            amplification: 20.0,
            jitter_buffer_size: 0, /* 10 ms */
            volume: 1.0,
            output_delay: 0, /* 10 ms */
            mic_boost: 1.0,
            enable_preprocessor: true,
            enable_echo_cancellation: true,
            enable_comfort_noise: false,
            comfort_noise_level: 0.0,
            enable_vad_gate: false,
            vad_gate_time_seconds: 0.0,
            prefer_receiver_over_speaker: true,
            opus_force_celt_mode: true,
            audio_mixer_debug: false,
        }
    }
}

/// PCM format the capture loop delivers and the encoder consumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamFormat {
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Interleaved channel count
    pub channels: u32,
    /// Codec frame duration in ms
    pub frame_duration_ms: u32,
}

impl Default for StreamFormat {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channels: 1,
            frame_duration_ms: 10,
        }
    }
}

impl StreamFormat {
    /// Total interleaved i16 samples per codec frame.
    pub fn frame_samples(&self) -> usize {
        (self.sample_rate * self.frame_duration_ms / 1000) as usize * self.channels as usize
    }
}
