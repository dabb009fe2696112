//! voicecast - Microphone-to-broadcast audio streaming session
//!
//! Captured PCM buffers are gated by a configurable transmit policy
//! (voice-activity detection, push-to-talk, or continuous), encoded, and
//! streamed to a room/account-addressed broadcast endpoint. Microphone
//! capture, playback, and Speex/CELT codecs live outside this crate and
//! plug in through the capability traits.

mod encoder;
mod error;
mod preprocess;
mod session;
mod settings;
mod transport;
mod vad;

pub use encoder::{FrameEncoder, OpusEncoder, new_encoder};
pub use error::{ConfigError, SessionError, TransportError};
#[cfg(feature = "speexdsp")]
pub use preprocess::SpeexPreprocessor;
pub use preprocess::{GainPreprocessor, Preprocessor, new_preprocessor};
pub use session::{SessionEvent, SessionState, StreamingSession};
pub use settings::{AudioSettings, CodecFormat, StreamFormat, TransmitType, VadKind};
pub use transport::{StreamTarget, Transport, WsTransport};
pub use vad::VoiceActivityGate;
