//! Voice processing stage between the microphone and the encoder

use super::vad::EnergyVad;

/// Output of one processor feed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessorOutput {
    /// A complete 16 kHz frame ready for encoding
    Frame(Vec<i16>),

    /// Speech started (`true`) or ended (`false`)
    VoiceActivity(bool),
}

/// Voice processor capability consumed by the capture unit
pub trait AudioProcessor: Send {
    /// Samples expected per `feed` call (per channel)
    fn feed_size(&self) -> usize;

    /// Feed 16 kHz audio, interleaved mic/reference pairs when the hardware
    /// captures two channels
    fn feed(&mut self, pcm: Vec<i16>) -> Vec<ProcessorOutput>;

    fn start(&mut self);

    fn stop(&mut self);

    fn is_running(&self) -> bool;

    /// Toggle on-device echo cancellation
    fn enable_device_aec(&mut self, enable: bool);
}

/// Re-chunks captured audio into codec frames and reports voice activity
pub struct PassthroughProcessor {
    frame_samples: usize,
    channels: usize,
    feed_size: usize,
    pending: Vec<i16>,
    vad: EnergyVad,
    running: bool,
    device_aec: bool,
}

impl PassthroughProcessor {
    /// Create a processor emitting mono frames of `frame_samples`
    #[must_use]
    pub fn new(frame_samples: usize, channels: u16) -> Self {
        Self {
            frame_samples,
            channels: usize::from(channels.max(1)),
            // Capture in half-frames so activity changes land quickly
            feed_size: (frame_samples / 2).max(1),
            pending: Vec::with_capacity(frame_samples),
            vad: EnergyVad::default(),
            running: false,
            device_aec: false,
        }
    }

    #[must_use]
    pub const fn device_aec(&self) -> bool {
        self.device_aec
    }
}

impl AudioProcessor for PassthroughProcessor {
    fn feed_size(&self) -> usize {
        self.feed_size
    }

    fn feed(&mut self, pcm: Vec<i16>) -> Vec<ProcessorOutput> {
        if !self.running {
            return Vec::new();
        }

        // Keep the mic channel; the reference only matters to a real canceller
        let pcm: Vec<i16> = if self.channels > 1 {
            pcm.into_iter().step_by(self.channels).collect()
        } else {
            pcm
        };

        let mut outputs = Vec::new();
        if let Some(speaking) = self.vad.update(&pcm) {
            outputs.push(ProcessorOutput::VoiceActivity(speaking));
        }

        self.pending.extend(pcm);
        while self.pending.len() >= self.frame_samples {
            let rest = self.pending.split_off(self.frame_samples);
            outputs.push(ProcessorOutput::Frame(std::mem::replace(
                &mut self.pending,
                rest,
            )));
        }
        outputs
    }

    fn start(&mut self) {
        self.running = true;
    }

    fn stop(&mut self) {
        self.running = false;
        self.pending.clear();
        self.vad.reset();
    }

    fn is_running(&self) -> bool {
        self.running
    }

    fn enable_device_aec(&mut self, enable: bool) {
        // No echo canceller on the host; the flag is reported to the server
        self.device_aec = enable;
        tracing::debug!(enable, "device aec toggled");
    }
}
