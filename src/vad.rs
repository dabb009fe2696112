//! Per-chunk transmit gating: hysteresis VAD, push-to-talk toggle,
//! continuous mode, and comfort-noise substitution.

use rand::Rng;

use crate::settings::{AudioSettings, TransmitType};

/// Decides, per incoming audio chunk, whether the session is transmitting.
///
/// For `TransmitType::Vad` the gate opens when the measured level reaches
/// `vad_max` and closes when it falls below `vad_min`; levels inside the
/// band keep the previous state, which prevents chatter around a single
/// threshold. With `enable_vad_gate` the gate additionally stays open for
/// `vad_gate_time_seconds` of feed time after the level last reached
/// `vad_min` (hangover).
///
/// Time advances with fed samples, not wall clock, so the gate is a pure
/// function of (level, chunk length, settings, internal state).
pub struct VoiceActivityGate {
    sample_rate: u32,
    talking: bool,
    toggle: bool,
    /// Feed time accumulated since the level last reached vad_min.
    quiet_secs: f64,
}

impl VoiceActivityGate {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            talking: false,
            toggle: false,
            quiet_secs: 0.0,
        }
    }

    /// Clear hysteresis and hangover state. Called on every session start.
    pub fn reset(&mut self) {
        self.talking = false;
        self.quiet_secs = 0.0;
    }

    /// Assert or release the push-to-talk toggle.
    pub fn set_toggle(&mut self, on: bool) {
        self.toggle = on;
    }

    /// Whether the gate was open after the last update.
    pub fn is_open(&self) -> bool {
        self.talking
    }

    /// Normalized peak amplitude of an i16 chunk.
    pub fn peak_amplitude(pcm: &[i16]) -> f32 {
        let peak = pcm.iter().map(|s| (*s as i32).abs()).max().unwrap_or(0);
        peak as f32 / -(i16::MIN as f32)
    }

    /// Advance the gate by one chunk and return whether it is open.
    ///
    /// `level` is the measured signal level in [0,1] (peak amplitude or
    /// preprocessor speech probability, per `vad_kind`); `frames` is the
    /// per-channel sample count of the chunk.
    pub fn update(&mut self, level: f32, frames: usize, settings: &AudioSettings) -> bool {
        match settings.transmit_type {
            TransmitType::Continuous => true,
            TransmitType::Toggle => self.toggle,
            TransmitType::Vad => {
                if self.talking {
                    if level >= settings.vad_min {
                        self.quiet_secs = 0.0;
                    } else if settings.enable_vad_gate {
                        self.quiet_secs += frames as f64 / self.sample_rate as f64;
                        if self.quiet_secs >= settings.vad_gate_time_seconds {
                            self.talking = false;
                        }
                    } else {
                        self.talking = false;
                    }
                } else if level >= settings.vad_max {
                    self.talking = true;
                    self.quiet_secs = 0.0;
                }
                self.talking
            }
        }
    }

    /// Synthesize a comfort-noise chunk of `samples` interleaved i16 samples
    /// at the given normalized amplitude.
    pub fn comfort_fill(samples: usize, level: f32) -> Vec<i16> {
        let amp = level.clamp(0.0, 1.0) * i16::MAX as f32;
        let mut rng = rand::rng();
        (0..samples)
            .map(|_| (rng.random_range(-1.0f32..1.0) * amp) as i16)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::VadKind;

    fn vad_settings() -> AudioSettings {
        AudioSettings {
            transmit_type: TransmitType::Vad,
            vad_kind: VadKind::Amplitude,
            vad_min: 0.3,
            vad_max: 0.6,
            ..AudioSettings::default()
        }
    }

    #[test]
    fn peak_amplitude_is_normalized() {
        assert_eq!(VoiceActivityGate::peak_amplitude(&[]), 0.0);
        assert_eq!(VoiceActivityGate::peak_amplitude(&[0, 0, 0]), 0.0);
        assert_eq!(VoiceActivityGate::peak_amplitude(&[i16::MIN]), 1.0);
        let v = VoiceActivityGate::peak_amplitude(&[(0.5 * 32768.0) as i16]);
        assert!((v - 0.5).abs() < 1e-3);
    }

    #[test]
    fn hysteresis_produces_one_open_interval() {
        let settings = vad_settings();
        let mut gate = VoiceActivityGate::new(48000);

        // Rising through the band: closed until vad_max is reached.
        let rising = [0.0, 0.2, 0.4, 0.5, 0.61, 0.8];
        let opens: Vec<bool> = rising
            .iter()
            .map(|&l| gate.update(l, 480, &settings))
            .collect();
        assert_eq!(opens, [false, false, false, false, true, true]);

        // Falling back through the band: stays open until below vad_min.
        let falling = [0.5, 0.4, 0.31, 0.29, 0.1];
        let opens: Vec<bool> = falling
            .iter()
            .map(|&l| gate.update(l, 480, &settings))
            .collect();
        assert_eq!(opens, [true, true, true, false, false]);
    }

    #[test]
    fn band_levels_do_not_reopen_gate() {
        let settings = vad_settings();
        let mut gate = VoiceActivityGate::new(48000);

        // A level inside [vad_min, vad_max) never opens a closed gate.
        for _ in 0..20 {
            assert!(!gate.update(0.45, 480, &settings));
        }
    }

    #[test]
    fn hangover_keeps_gate_open_for_configured_feed_time() {
        let settings = AudioSettings {
            enable_vad_gate: true,
            vad_gate_time_seconds: 0.1,
            ..vad_settings()
        };
        let mut gate = VoiceActivityGate::new(48000);

        assert!(gate.update(0.9, 480, &settings));

        // 480 frames @ 48 kHz = 10 ms per chunk; gate closes on the chunk
        // where the accumulated quiet time reaches 100 ms.
        let mut open_chunks = 0;
        for _ in 0..20 {
            if gate.update(0.0, 480, &settings) {
                open_chunks += 1;
            } else {
                break;
            }
        }
        assert_eq!(open_chunks, 9);
        assert!(!gate.is_open());
    }

    #[test]
    fn hangover_timer_resets_on_renewed_voice() {
        let settings = AudioSettings {
            enable_vad_gate: true,
            vad_gate_time_seconds: 0.05,
            ..vad_settings()
        };
        let mut gate = VoiceActivityGate::new(48000);

        assert!(gate.update(0.9, 480, &settings));
        // A quiet chunk (25 ms), then a band-level chunk resets the timer.
        assert!(gate.update(0.0, 1200, &settings));
        assert!(gate.update(0.4, 480, &settings));
        // The full 50 ms hangover is available again.
        assert!(gate.update(0.0, 1200, &settings));
        assert!(!gate.update(0.0, 1200, &settings));
    }

    #[test]
    fn toggle_policy_follows_external_flag() {
        let settings = AudioSettings {
            transmit_type: TransmitType::Toggle,
            ..AudioSettings::default()
        };
        let mut gate = VoiceActivityGate::new(48000);

        // Measurement is ignored for push-to-talk.
        assert!(!gate.update(1.0, 480, &settings));
        gate.set_toggle(true);
        assert!(gate.update(0.0, 480, &settings));
        gate.set_toggle(false);
        assert!(!gate.update(1.0, 480, &settings));
    }

    #[test]
    fn continuous_policy_is_always_open() {
        let settings = AudioSettings {
            transmit_type: TransmitType::Continuous,
            ..AudioSettings::default()
        };
        let mut gate = VoiceActivityGate::new(48000);
        assert!(gate.update(0.0, 480, &settings));
        assert!(gate.update(1.0, 480, &settings));
    }

    #[test]
    fn comfort_fill_respects_level() {
        let silent = VoiceActivityGate::comfort_fill(480, 0.0);
        assert_eq!(silent.len(), 480);
        assert!(silent.iter().all(|&s| s == 0));

        let quiet = VoiceActivityGate::comfort_fill(480, 0.01);
        let bound = (0.011 * i16::MAX as f32) as i16;
        assert!(quiet.iter().all(|&s| s.abs() <= bound));
    }

    #[test]
    fn reset_clears_talking_state() {
        let settings = vad_settings();
        let mut gate = VoiceActivityGate::new(48000);
        gate.update(0.9, 480, &settings);
        assert!(gate.is_open());
        gate.reset();
        assert!(!gate.is_open());
        // Band level after reset does not reopen.
        assert!(!gate.update(0.4, 480, &settings));
    }
}
