//! Typed errors for the session lifecycle and the transport capability.

use thiserror::Error;

/// Settings/target rejection at the configure boundary.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A settings invariant does not hold (vad_min > vad_max, quality <= 0,
    /// audio_per_packet < 1, thresholds outside [0,1] for amplitude VAD).
    #[error("invalid setting range: {0}")]
    InvalidRange(&'static str),

    /// The session is streaming; stop it before reconfiguring.
    #[error("session is streaming, stop it before reconfiguring")]
    SessionActive,
}

/// Lifecycle errors, returned synchronously to the caller.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session is not configured")]
    NotConfigured,

    /// The process-wide streaming slot is already held.
    #[error("a session is already streaming")]
    AlreadyStreaming,

    #[error("session is not streaming")]
    NotStreaming,

    /// The configured codec has no built-in encoder; inject one via `start_with`.
    #[error("codec unavailable: {0}")]
    Codec(#[source] anyhow::Error),

    #[error("failed to spawn stream worker: {0}")]
    Worker(#[from] std::io::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Failures reported by the transport capability.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("send failed: {0}")]
    Send(#[source] anyhow::Error),

    #[error("transport is closed")]
    Closed,
}
