//! Signal preprocessor capability: input gain, noise handling, and the
//! speech-probability estimate used by SNR-based voice-activity detection.
//!
//! The built-in [`GainPreprocessor`] is pure Rust. With the `speexdsp`
//! feature a libspeexdsp-backed implementation is available as well.

use crate::settings::{AudioSettings, StreamFormat};

/// In-place chunk processing plus the speech-probability estimate consumed
/// by the gate when `vad_kind == SignalToNoise`.
pub trait Preprocessor: Send {
    /// Process one chunk of interleaved i16 PCM samples in place.
    fn process(&mut self, samples: &mut [i16]);

    /// Estimated probability in [0,1] that the last processed chunk was speech.
    fn speech_probability(&self) -> f32;
}

/// Build the preprocessor for the given settings.
pub fn new_preprocessor(
    settings: &AudioSettings,
    format: &StreamFormat,
) -> Box<dyn Preprocessor> {
    #[cfg(feature = "speexdsp")]
    {
        match SpeexPreprocessor::new(settings, format) {
            Ok(pp) => return Box::new(pp),
            Err(e) => {
                log::warn!("speexdsp preprocessor unavailable ({e}), using built-in");
            }
        }
    }
    #[cfg(not(feature = "speexdsp"))]
    let _ = format;
    Box::new(GainPreprocessor::new(settings))
}

// ======================== Built-in preprocessor ========================

/// Smoothing factor for the chunk level estimate.
const LEVEL_SMOOTHING: f32 = 0.3;
/// How quickly the noise floor creeps up toward the current level.
const FLOOR_RISE: f32 = 0.01;
/// Lower bound keeping the floor estimate away from zero.
const FLOOR_MIN: f32 = 1e-4;

/// Pure-Rust preprocessor: applies `mic_boost` and `amplification` gain and
/// tracks a noise floor to estimate speech probability.
///
/// The floor follows the signal down immediately and rises slowly, so
/// sustained speech keeps a high level/floor ratio while a changed ambient
/// level is absorbed within a few seconds.
pub struct GainPreprocessor {
    gain: f32,
    /// Suppression depth in dB; the ratio is mapped onto [0,1] across it.
    snr_span_db: f32,
    smoothed_level: f32,
    noise_floor: f32,
    speech_prob: f32,
}

impl GainPreprocessor {
    pub fn new(settings: &AudioSettings) -> Self {
        Self {
            gain: settings.mic_boost * settings.amplification,
            snr_span_db: (-settings.noise_suppression).max(1) as f32,
            smoothed_level: 0.0,
            noise_floor: FLOOR_MIN,
            speech_prob: 0.0,
        }
    }

    fn rms(samples: &[i16]) -> f32 {
        if samples.is_empty() {
            return 0.0;
        }
        let sum: f64 = samples
            .iter()
            .map(|&s| {
                let v = s as f64 / 32768.0;
                v * v
            })
            .sum();
        (sum / samples.len() as f64).sqrt() as f32
    }
}

impl Preprocessor for GainPreprocessor {
    fn process(&mut self, samples: &mut [i16]) {
        if (self.gain - 1.0).abs() > f32::EPSILON {
            for s in samples.iter_mut() {
                let v = (*s as f32 * self.gain).clamp(i16::MIN as f32, i16::MAX as f32);
                *s = v as i16;
            }
        }

        let rms = Self::rms(samples);
        self.smoothed_level =
            (1.0 - LEVEL_SMOOTHING) * self.smoothed_level + LEVEL_SMOOTHING * rms;

        if rms < self.noise_floor {
            self.noise_floor = rms.max(FLOOR_MIN);
        } else {
            self.noise_floor += (rms - self.noise_floor) * FLOOR_RISE;
        }

        let snr_db = 20.0 * (self.smoothed_level / self.noise_floor).max(1e-6).log10();
        self.speech_prob = (snr_db / self.snr_span_db).clamp(0.0, 1.0);
    }

    fn speech_probability(&self) -> f32 {
        self.speech_prob
    }
}

// ======================== SpeexDSP preprocessor ========================

#[cfg(feature = "speexdsp")]
pub use self::speex::SpeexPreprocessor;

#[cfg(feature = "speexdsp")]
mod speex {
    //! Safe wrapper around SpeexDSP's preprocessor (denoise/AGC/probability).

    use std::ffi::{c_int, c_void};

    use super::Preprocessor;
    use crate::settings::{AudioSettings, StreamFormat};

    /// Opaque type for SpeexPreprocessState
    #[repr(C)]
    struct SpeexPreprocessState {
        _private: [u8; 0],
    }

    // Preprocessor request constants
    const SPEEX_PREPROCESS_SET_DENOISE: c_int = 0;
    const SPEEX_PREPROCESS_SET_AGC: c_int = 2;
    const SPEEX_PREPROCESS_SET_AGC_LEVEL: c_int = 6;
    const SPEEX_PREPROCESS_SET_NOISE_SUPPRESS: c_int = 8;
    const SPEEX_PREPROCESS_GET_PROB: c_int = 45;

    unsafe extern "C" {
        fn speex_preprocess_state_init(
            frame_size: c_int,
            sampling_rate: c_int,
        ) -> *mut SpeexPreprocessState;
        fn speex_preprocess_state_destroy(st: *mut SpeexPreprocessState);
        fn speex_preprocess_run(st: *mut SpeexPreprocessState, x: *mut i16) -> c_int;
        fn speex_preprocess_ctl(
            st: *mut SpeexPreprocessState,
            request: c_int,
            ptr: *mut c_void,
        ) -> c_int;
    }

    /// Preprocessor backed by libspeexdsp: denoise, noise suppression, AGC,
    /// and the library's own voice-activity probability.
    pub struct SpeexPreprocessor {
        state: *mut SpeexPreprocessState,
        /// Samples per preprocess run; fixed at state init.
        frame_size: usize,
        mic_boost: f32,
        speech_prob: f32,
    }

    // SpeexPreprocessState is used from a single thread only
    unsafe impl Send for SpeexPreprocessor {}

    impl SpeexPreprocessor {
        pub fn new(settings: &AudioSettings, format: &StreamFormat) -> anyhow::Result<Self> {
            let frame_size = format.frame_samples();
            let state = unsafe {
                speex_preprocess_state_init(
                    frame_size as c_int,
                    format.sample_rate as c_int,
                )
            };
            if state.is_null() {
                anyhow::bail!("Failed to initialize speex preprocessor");
            }

            let mut pp = Self {
                state,
                frame_size,
                mic_boost: settings.mic_boost,
                speech_prob: 0.0,
            };
            pp.set_int(SPEEX_PREPROCESS_SET_DENOISE, 1);
            pp.set_int(SPEEX_PREPROCESS_SET_NOISE_SUPPRESS, settings.noise_suppression);
            pp.set_int(SPEEX_PREPROCESS_SET_AGC, 1);
            pp.set_float(
                SPEEX_PREPROCESS_SET_AGC_LEVEL,
                settings.amplification * 1200.0,
            );
            Ok(pp)
        }

        fn set_int(&mut self, request: c_int, value: i32) {
            let mut val: c_int = value;
            unsafe {
                speex_preprocess_ctl(self.state, request, &mut val as *mut c_int as *mut c_void);
            }
        }

        fn set_float(&mut self, request: c_int, value: f32) {
            let mut val: f32 = value;
            unsafe {
                speex_preprocess_ctl(self.state, request, &mut val as *mut f32 as *mut c_void);
            }
        }

        fn get_prob(&self) -> f32 {
            let mut val: c_int = 0;
            unsafe {
                speex_preprocess_ctl(
                    self.state,
                    SPEEX_PREPROCESS_GET_PROB,
                    &mut val as *mut c_int as *mut c_void,
                );
            }
            val as f32 / 100.0
        }
    }

    impl Preprocessor for SpeexPreprocessor {
        fn process(&mut self, samples: &mut [i16]) {
            if (self.mic_boost - 1.0).abs() > f32::EPSILON {
                for s in samples.iter_mut() {
                    let v = (*s as f32 * self.mic_boost)
                        .clamp(i16::MIN as f32, i16::MAX as f32);
                    *s = v as i16;
                }
            }

            // The state is bound to frame_size; run full frames and pass any
            // trailing partial frame through untouched.
            for frame in samples.chunks_exact_mut(self.frame_size) {
                unsafe {
                    speex_preprocess_run(self.state, frame.as_mut_ptr());
                }
                self.speech_prob = self.get_prob();
            }
        }

        fn speech_probability(&self) -> f32 {
            self.speech_prob
        }
    }

    impl Drop for SpeexPreprocessor {
        fn drop(&mut self) {
            unsafe {
                speex_preprocess_state_destroy(self.state);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings_with_gain(mic_boost: f32, amplification: f32) -> AudioSettings {
        AudioSettings {
            mic_boost,
            amplification,
            ..AudioSettings::default()
        }
    }

    #[test]
    fn unity_gain_leaves_samples_untouched() {
        let mut pp = GainPreprocessor::new(&settings_with_gain(1.0, 1.0));
        let mut samples = vec![100i16, -200, 300];
        pp.process(&mut samples);
        assert_eq!(samples, [100, -200, 300]);
    }

    #[test]
    fn gain_scales_and_saturates() {
        let mut pp = GainPreprocessor::new(&settings_with_gain(2.0, 1.0));
        let mut samples = vec![1000i16, -1000, 20000];
        pp.process(&mut samples);
        assert_eq!(samples[0], 2000);
        assert_eq!(samples[1], -2000);
        // 40000 clips at i16::MAX
        assert_eq!(samples[2], i16::MAX);
    }

    #[test]
    fn speech_probability_rises_with_signal_over_floor() {
        let mut pp = GainPreprocessor::new(&settings_with_gain(1.0, 1.0));

        // Establish the floor with silence.
        let mut silence = vec![0i16; 480];
        for _ in 0..10 {
            pp.process(&mut silence);
        }
        let quiet_prob = pp.speech_probability();

        // A loud chunk should push the estimate well above the quiet one.
        let mut loud = vec![20000i16; 480];
        for _ in 0..5 {
            pp.process(&mut loud);
        }
        assert!(pp.speech_probability() > quiet_prob);
        assert!(pp.speech_probability() > 0.5);
    }
}
