//! Sample-rate conversion between capture, codec and speaker rates

use rubato::{FftFixedIn, Resampler as _};

use crate::{Error, Result};

/// Mono frame resampler
///
/// Built for a fixed input chunk; feeding a frame of a different length
/// rebuilds the underlying FFT resampler.
pub struct Resampler {
    from_rate: u32,
    to_rate: u32,
    chunk: usize,
    inner: Option<FftFixedIn<f64>>,
}

impl Resampler {
    #[must_use]
    pub const fn new(from_rate: u32, to_rate: u32) -> Self {
        Self {
            from_rate,
            to_rate,
            chunk: 0,
            inner: None,
        }
    }

    #[must_use]
    pub const fn from_rate(&self) -> u32 {
        self.from_rate
    }

    #[must_use]
    pub const fn to_rate(&self) -> u32 {
        self.to_rate
    }

    /// Whether input passes through untouched
    #[must_use]
    pub const fn is_passthrough(&self) -> bool {
        self.from_rate == self.to_rate
    }

    /// Convert one frame
    ///
    /// # Errors
    ///
    /// Returns error if the resampler cannot be built or fails to process
    #[allow(clippy::cast_possible_truncation)]
    pub fn process(&mut self, pcm: &[i16]) -> Result<Vec<i16>> {
        if self.is_passthrough() || pcm.is_empty() {
            return Ok(pcm.to_vec());
        }

        if self.inner.is_none() || self.chunk != pcm.len() {
            let resampler =
                FftFixedIn::<f64>::new(self.from_rate as usize, self.to_rate as usize, pcm.len(), 2, 1)
                    .map_err(|e| Error::Audio(format!("resampler init failed: {e}")))?;
            tracing::debug!(
                from = self.from_rate,
                to = self.to_rate,
                chunk = pcm.len(),
                "resampler configured"
            );
            self.chunk = pcm.len();
            self.inner = Some(resampler);
        }

        let Some(resampler) = self.inner.as_mut() else {
            return Ok(pcm.to_vec());
        };

        let input: Vec<f64> = pcm.iter().map(|&s| f64::from(s)).collect();
        let output = resampler
            .process(&[input], None)
            .map_err(|e| Error::Audio(format!("resample failed: {e}")))?;

        Ok(output
            .first()
            .map(|ch| {
                ch.iter()
                    .map(|&s| s.round().clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16)
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Drop filter history
    pub fn reset(&mut self) {
        if let Some(inner) = self.inner.as_mut() {
            inner.reset();
        }
    }
}
