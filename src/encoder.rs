//! Encoder capability: codec trait, the built-in Opus implementation, and
//! the settings-driven factory.

use anyhow::Result;

use crate::settings::{AudioSettings, CodecFormat, StreamFormat};

/// A frame encoder turning interleaved i16 PCM into encoded packets.
///
/// Implementations own any codec state; `flush` drains whatever the codec
/// buffered and is called exactly once when the session stops.
pub trait FrameEncoder: Send {
    /// Total interleaved i16 samples consumed per `encode` call.
    fn frame_samples(&self) -> usize;

    /// Encode one frame of PCM data. Input length equals `frame_samples()`.
    fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>>;

    /// Drain buffered codec state on shutdown.
    fn flush(&mut self) -> Result<Option<Vec<u8>>>;
}

/// Build the encoder for the configured codec.
///
/// Speex and CELT are external capabilities; sessions using them inject an
/// encoder through `start_with`.
pub fn new_encoder(
    settings: &AudioSettings,
    format: &StreamFormat,
) -> Result<Box<dyn FrameEncoder>> {
    match settings.codec {
        CodecFormat::Opus => Ok(Box::new(OpusEncoder::new(settings, format)?)),
        other => anyhow::bail!(
            "no built-in encoder for codec '{}', inject one via start_with",
            other.wire_name()
        ),
    }
}

// ======================== Opus Encoder ========================

pub struct OpusEncoder {
    encoder: opus::Encoder,
    frame_samples: usize,
}

impl OpusEncoder {
    /// Create an Opus encoder from session settings.
    ///
    /// `quality` sets the bitrate. `opus_force_celt_mode` selects the
    /// restricted low-delay application, which is Opus's CELT-only mode.
    pub fn new(settings: &AudioSettings, format: &StreamFormat) -> Result<Self> {
        let channels = if format.channels == 1 {
            opus::Channels::Mono
        } else {
            opus::Channels::Stereo
        };
        let application = if settings.opus_force_celt_mode {
            opus::Application::LowDelay
        } else {
            opus::Application::Voip
        };

        let mut encoder = opus::Encoder::new(format.sample_rate, channels, application)?;
        encoder.set_bitrate(opus::Bitrate::Bits(settings.quality))?;

        Ok(Self {
            encoder,
            frame_samples: format.frame_samples(),
        })
    }
}

impl FrameEncoder for OpusEncoder {
    fn frame_samples(&self) -> usize {
        self.frame_samples
    }

    fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>> {
        let mut opus_buf = vec![0u8; 4000];
        let encoded_len = self.encoder.encode(pcm, &mut opus_buf)?;
        opus_buf.truncate(encoded_len);
        Ok(opus_buf)
    }

    fn flush(&mut self) -> Result<Option<Vec<u8>>> {
        // Opus carries no state across frames worth draining.
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_builds_opus_only() {
        let format = StreamFormat::default();
        let settings = AudioSettings::default();
        assert!(new_encoder(&settings, &format).is_ok());

        let speex = AudioSettings {
            codec: CodecFormat::Speex,
            ..settings
        };
        assert!(new_encoder(&speex, &format).is_err());
    }

    #[test]
    fn opus_encoder_produces_packets_at_frame_size() {
        let format = StreamFormat::default();
        let settings = AudioSettings::default();
        let mut enc = OpusEncoder::new(&settings, &format).unwrap();
        assert_eq!(enc.frame_samples(), 480);

        let frame = vec![1000i16; 480];
        let packet = enc.encode(&frame).unwrap();
        assert!(!packet.is_empty());
        assert!(enc.flush().unwrap().is_none());
    }
}
