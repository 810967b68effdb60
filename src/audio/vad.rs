//! Energy-based voice activity detection

/// Minimum RMS energy considered speech
pub const ENERGY_THRESHOLD: f32 = 0.03;

/// Silence needed before speech is considered over (0.5 s at 16 kHz)
pub const SILENCE_SAMPLES: usize = 8000;

/// RMS energy of 16-bit samples, normalized to 0.0-1.0
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn calculate_rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f32 = samples
        .iter()
        .map(|&s| {
            let v = f32::from(s) / 32768.0;
            v * v
        })
        .sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// Tracks speech/silence transitions with a silence hangover
#[derive(Debug, Clone)]
pub struct EnergyVad {
    threshold: f32,
    hangover: usize,
    speaking: bool,
    silence: usize,
}

impl Default for EnergyVad {
    fn default() -> Self {
        Self::new(ENERGY_THRESHOLD, SILENCE_SAMPLES)
    }
}

impl EnergyVad {
    #[must_use]
    pub const fn new(threshold: f32, hangover: usize) -> Self {
        Self {
            threshold,
            hangover,
            speaking: false,
            silence: 0,
        }
    }

    /// Feed one chunk; returns the new activity state on a transition
    pub fn update(&mut self, samples: &[i16]) -> Option<bool> {
        let is_speech = calculate_rms(samples) > self.threshold;

        if is_speech {
            self.silence = 0;
            if !self.speaking {
                self.speaking = true;
                return Some(true);
            }
        } else if self.speaking {
            self.silence += samples.len();
            if self.silence >= self.hangover {
                self.speaking = false;
                self.silence = 0;
                return Some(false);
            }
        }
        None
    }

    #[must_use]
    pub const fn is_speaking(&self) -> bool {
        self.speaking
    }

    pub const fn reset(&mut self) {
        self.speaking = false;
        self.silence = 0;
    }
}
