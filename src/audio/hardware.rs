//! Codec hardware port
//!
//! The pipeline talks to the microphone and speaker only through this trait, so
//! tests and alternative boards can substitute their own implementation.

use std::time::Duration;

use crate::Result;

/// Raw PCM input/output with explicit power gating
///
/// `read_input` and `write_output` are called from the pipeline's capture and
/// output threads respectively and may block for up to about one frame.
pub trait AudioHardware: Send + Sync {
    /// Native capture rate
    fn input_sample_rate(&self) -> u32;

    /// Native playback rate
    fn output_sample_rate(&self) -> u32;

    /// Interleaved capture channels (2 = mic + echo reference)
    fn input_channels(&self) -> u16;

    /// Read exactly `samples` interleaved samples
    ///
    /// Returns `Ok(None)` if the samples did not arrive within `timeout`.
    ///
    /// # Errors
    ///
    /// Returns error if the input path failed
    fn read_input(&self, samples: usize, timeout: Duration) -> Result<Option<Vec<i16>>>;

    /// Write one mono frame to the speaker
    ///
    /// # Errors
    ///
    /// Returns error if the output path failed
    fn write_output(&self, pcm: &[i16]) -> Result<()>;

    /// Power the input path up or down
    fn enable_input(&self, enable: bool);

    /// Power the output path up or down
    fn enable_output(&self, enable: bool);

    /// Whether the input path is powered
    fn input_enabled(&self) -> bool;

    /// Whether the output path is powered
    fn output_enabled(&self) -> bool;

    /// Speaker volume (0-100)
    fn set_output_volume(&self, volume: u8);

    /// Current speaker volume
    fn output_volume(&self) -> u8;
}
