//! Wake word detection
//!
//! Backends implement [`WakeWord`]; the capture unit feeds them 16 kHz mono
//! audio while wake word detection is enabled.

use super::vad::{ENERGY_THRESHOLD, SILENCE_SAMPLES, calculate_rms};

/// Minimum duration of speech to trigger (0.3 s at 16 kHz)
const MIN_SPEECH_SAMPLES: usize = 4800;

/// Samples consumed per feed (30 ms at 16 kHz)
const FEED_SIZE: usize = 480;

/// Wake word capability consumed by the capture unit
pub trait WakeWord: Send {
    /// Samples expected per `feed` call
    fn feed_size(&self) -> usize;

    /// Feed 16 kHz mono audio; returns the detected phrase, if any
    fn feed(&mut self, pcm: &[i16]) -> Option<String>;

    /// Begin detection
    fn start(&mut self);

    /// Suspend detection and drop partial state
    fn stop(&mut self);

    /// Whether detection may keep running while the device is speaking
    fn supports_concurrent(&self) -> bool {
        false
    }
}

/// State of the energy detector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorState {
    /// Detection suspended
    Stopped,
    /// Waiting for speech
    Idle,
    /// Detected potential speech, accumulating
    Listening,
}

/// Energy-gated wake word backend
///
/// Reports the first configured phrase after a burst of speech followed by
/// silence. There is no phonetic model, so any short utterance triggers it.
pub struct EnergyWakeWord {
    wake_words: Vec<String>,
    state: DetectorState,
    speech_samples: usize,
    silence_counter: usize,
}

impl EnergyWakeWord {
    /// Create a detector reporting `wake_words[0]`
    #[must_use]
    pub fn new(wake_words: Vec<String>) -> Self {
        let normalized: Vec<String> = wake_words
            .into_iter()
            .map(|w| w.trim().to_lowercase())
            .filter(|w| !w.is_empty())
            .collect();

        tracing::debug!(wake_words = ?normalized, "wake word detector initialized");

        Self {
            wake_words: normalized,
            state: DetectorState::Stopped,
            speech_samples: 0,
            silence_counter: 0,
        }
    }

    #[must_use]
    pub const fn state(&self) -> DetectorState {
        self.state
    }

    #[must_use]
    pub fn wake_words(&self) -> &[String] {
        &self.wake_words
    }

    fn reset(&mut self) {
        self.state = DetectorState::Idle;
        self.speech_samples = 0;
        self.silence_counter = 0;
    }
}

impl WakeWord for EnergyWakeWord {
    fn feed_size(&self) -> usize {
        FEED_SIZE
    }

    fn feed(&mut self, pcm: &[i16]) -> Option<String> {
        let energy = calculate_rms(pcm);
        let is_speech = energy > ENERGY_THRESHOLD;

        match self.state {
            DetectorState::Stopped => {}
            DetectorState::Idle => {
                if is_speech {
                    self.state = DetectorState::Listening;
                    self.speech_samples = pcm.len();
                    self.silence_counter = 0;
                    tracing::trace!(energy, "speech detected, listening");
                }
            }
            DetectorState::Listening => {
                if is_speech {
                    self.speech_samples += pcm.len();
                    self.silence_counter = 0;
                } else {
                    self.silence_counter += pcm.len();
                }

                if self.silence_counter > SILENCE_SAMPLES
                    && self.speech_samples > MIN_SPEECH_SAMPLES
                {
                    tracing::debug!(samples = self.speech_samples, "speech segment complete");
                    self.reset();
                    return Some(
                        self.wake_words
                            .first()
                            .cloned()
                            .unwrap_or_else(|| "wake".to_string()),
                    );
                }

                // Too much silence without enough speech
                if self.silence_counter > SILENCE_SAMPLES * 2 {
                    tracing::trace!("timeout - resetting");
                    self.reset();
                }
            }
        }

        None
    }

    fn start(&mut self) {
        if self.state == DetectorState::Stopped {
            self.reset();
        }
    }

    fn stop(&mut self) {
        self.state = DetectorState::Stopped;
        self.speech_samples = 0;
        self.silence_counter = 0;
    }
}
