//! Network audio codecs
//!
//! The pipeline's codec unit is the only owner of encoder and decoder
//! instances. Backends are chosen at startup from [`CodecKind`].

use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// Compression format used on the audio channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CodecKind {
    /// Uncompressed little-endian 16-bit PCM
    #[default]
    Pcm16,

    /// Opus, VoIP application mode
    Opus,
}

impl CodecKind {
    /// Name announced in the client hello
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pcm16 => "pcm16",
            Self::Opus => "opus",
        }
    }
}

impl FromStr for CodecKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "pcm" | "pcm16" => Ok(Self::Pcm16),
            "opus" => {
                if cfg!(feature = "opus") {
                    Ok(Self::Opus)
                } else {
                    Err(Error::Config(
                        "opus codec requires the `opus` feature".to_string(),
                    ))
                }
            }
            other => Err(Error::Config(format!("unknown codec: {other}"))),
        }
    }
}

impl fmt::Display for CodecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compresses 16 kHz mono frames for the uplink
pub trait Encoder: Send {
    /// Encode one frame
    ///
    /// # Errors
    ///
    /// Returns error if the backend rejects the frame
    fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>>;

    /// Drop any inter-frame state
    fn reset(&mut self);
}

/// Decompresses inbound packets
pub trait Decoder: Send {
    /// Rate the decoder produces
    fn sample_rate(&self) -> u32;

    /// Frame duration the decoder was configured for
    fn frame_duration_ms(&self) -> u32;

    /// Decode one packet
    ///
    /// # Errors
    ///
    /// Returns error if the payload is malformed
    fn decode(&mut self, payload: &[u8]) -> Result<Vec<i16>>;

    /// Drop any inter-frame state
    fn reset(&mut self);
}

/// Build an encoder for the fixed uplink format
///
/// # Errors
///
/// Returns error if the backend cannot be created
pub fn create_encoder(kind: CodecKind, sample_rate: u32) -> Result<Box<dyn Encoder>> {
    match kind {
        CodecKind::Pcm16 => Ok(Box::new(Pcm16Codec::new(sample_rate, 0))),
        CodecKind::Opus => opus::encoder(sample_rate),
    }
}

/// Build a decoder for the given inbound configuration
///
/// # Errors
///
/// Returns error if the backend cannot be created
pub fn create_decoder(
    kind: CodecKind,
    sample_rate: u32,
    frame_duration_ms: u32,
) -> Result<Box<dyn Decoder>> {
    match kind {
        CodecKind::Pcm16 => Ok(Box::new(Pcm16Codec::new(sample_rate, frame_duration_ms))),
        CodecKind::Opus => opus::decoder(sample_rate, frame_duration_ms),
    }
}

/// Pass-through codec carrying raw little-endian samples
#[derive(Debug, Clone, Copy)]
pub struct Pcm16Codec {
    sample_rate: u32,
    frame_duration_ms: u32,
}

impl Pcm16Codec {
    #[must_use]
    pub const fn new(sample_rate: u32, frame_duration_ms: u32) -> Self {
        Self {
            sample_rate,
            frame_duration_ms,
        }
    }
}

impl Encoder for Pcm16Codec {
    fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>> {
        Ok(pcm.iter().flat_map(|s| s.to_le_bytes()).collect())
    }

    fn reset(&mut self) {}
}

impl Decoder for Pcm16Codec {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn frame_duration_ms(&self) -> u32 {
        self.frame_duration_ms
    }

    fn decode(&mut self, payload: &[u8]) -> Result<Vec<i16>> {
        if payload.len() % 2 != 0 {
            return Err(Error::Codec(format!(
                "pcm16 payload has odd length {}",
                payload.len()
            )));
        }
        Ok(payload
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect())
    }

    fn reset(&mut self) {}
}

#[cfg(feature = "opus")]
mod opus {
    use audiopus::{
        Application, Channels, MutSignals, SampleRate,
        coder::{Decoder as OpusDecoder, Encoder as OpusEncoder},
        packet::Packet,
    };

    use super::{Decoder, Encoder};
    use crate::{Error, Result};

    /// Largest packet a single 60 ms frame can produce
    const MAX_PACKET_BYTES: usize = 4000;

    fn opus_rate(rate: u32) -> Result<SampleRate> {
        match rate {
            8000 => Ok(SampleRate::Hz8000),
            12000 => Ok(SampleRate::Hz12000),
            16000 => Ok(SampleRate::Hz16000),
            24000 => Ok(SampleRate::Hz24000),
            48000 => Ok(SampleRate::Hz48000),
            other => Err(Error::Codec(format!("unsupported opus sample rate: {other}"))),
        }
    }

    struct Enc {
        inner: OpusEncoder,
        rate: SampleRate,
    }

    impl Encoder for Enc {
        fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>> {
            let mut out = vec![0u8; MAX_PACKET_BYTES];
            let len = self
                .inner
                .encode(pcm, &mut out)
                .map_err(|e| Error::Codec(format!("opus encode: {e}")))?;
            out.truncate(len);
            Ok(out)
        }

        fn reset(&mut self) {
            match OpusEncoder::new(self.rate, Channels::Mono, Application::Voip) {
                Ok(enc) => self.inner = enc,
                Err(e) => tracing::warn!(error = %e, "failed to reset opus encoder"),
            }
        }
    }

    struct Dec {
        inner: OpusDecoder,
        rate: SampleRate,
        sample_rate: u32,
        frame_duration_ms: u32,
    }

    impl Decoder for Dec {
        fn sample_rate(&self) -> u32 {
            self.sample_rate
        }

        fn frame_duration_ms(&self) -> u32 {
            self.frame_duration_ms
        }

        fn decode(&mut self, payload: &[u8]) -> Result<Vec<i16>> {
            // Room for the longest opus frame (120 ms)
            let max_samples = self.sample_rate as usize * 120 / 1000;
            let mut out = vec![0i16; max_samples];

            let packet = Packet::try_from(payload)
                .map_err(|e| Error::Codec(format!("invalid opus packet: {e}")))?;
            let signals = MutSignals::try_from(&mut out[..])
                .map_err(|e| Error::Codec(format!("opus signal buffer: {e}")))?;
            let len = self
                .inner
                .decode(Some(packet), signals, false)
                .map_err(|e| Error::Codec(format!("opus decode: {e}")))?;

            out.truncate(len);
            Ok(out)
        }

        fn reset(&mut self) {
            match OpusDecoder::new(self.rate, Channels::Mono) {
                Ok(dec) => self.inner = dec,
                Err(e) => tracing::warn!(error = %e, "failed to reset opus decoder"),
            }
        }
    }

    pub(super) fn encoder(sample_rate: u32) -> Result<Box<dyn Encoder>> {
        let rate = opus_rate(sample_rate)?;
        let inner = OpusEncoder::new(rate, Channels::Mono, Application::Voip)
            .map_err(|e| Error::Codec(format!("failed to create opus encoder: {e}")))?;
        Ok(Box::new(Enc { inner, rate }))
    }

    pub(super) fn decoder(sample_rate: u32, frame_duration_ms: u32) -> Result<Box<dyn Decoder>> {
        let rate = opus_rate(sample_rate)?;
        let inner = OpusDecoder::new(rate, Channels::Mono)
            .map_err(|e| Error::Codec(format!("failed to create opus decoder: {e}")))?;
        Ok(Box::new(Dec {
            inner,
            rate,
            sample_rate,
            frame_duration_ms,
        }))
    }
}

#[cfg(not(feature = "opus"))]
mod opus {
    use super::{Decoder, Encoder};
    use crate::{Error, Result};

    fn unavailable() -> Error {
        Error::Codec("built without opus support".to_string())
    }

    pub(super) fn encoder(_sample_rate: u32) -> Result<Box<dyn Encoder>> {
        Err(unavailable())
    }

    pub(super) fn decoder(_sample_rate: u32, _frame_duration_ms: u32) -> Result<Box<dyn Decoder>> {
        Err(unavailable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_kind_parsing() {
        assert_eq!(CodecKind::from_str("PCM16").unwrap(), CodecKind::Pcm16);
        assert_eq!(CodecKind::Pcm16.to_string(), "pcm16");
        assert!(CodecKind::from_str("mp3").is_err());
    }

    #[test]
    fn test_pcm16_round_trip() {
        let mut enc = create_encoder(CodecKind::Pcm16, 16_000).unwrap();
        let mut dec = create_decoder(CodecKind::Pcm16, 16_000, 60).unwrap();

        let pcm = vec![0, 1, -1, i16::MAX, i16::MIN];
        let bytes = enc.encode(&pcm).unwrap();
        assert_eq!(bytes.len(), pcm.len() * 2);
        assert_eq!(dec.decode(&bytes).unwrap(), pcm);
        assert_eq!(dec.sample_rate(), 16_000);
        assert_eq!(dec.frame_duration_ms(), 60);
    }

    #[test]
    fn test_pcm16_rejects_odd_payload() {
        let mut dec = create_decoder(CodecKind::Pcm16, 16_000, 60).unwrap();
        assert!(matches!(dec.decode(&[1, 2, 3]), Err(Error::Codec(_))));
    }

    #[cfg(not(feature = "opus"))]
    #[test]
    fn test_opus_unavailable_without_feature() {
        assert!(CodecKind::from_str("opus").is_err());
        assert!(create_encoder(CodecKind::Opus, 16_000).is_err());
    }
}
