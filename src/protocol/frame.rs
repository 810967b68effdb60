//! Binary audio framing
//!
//! - version 1: the raw codec payload
//! - version 2: 16-byte header (version u16, type u16, reserved u32,
//!   timestamp u32, payload size u32), big-endian
//! - version 3: 4-byte header (type u8, reserved u8, payload size u16),
//!   big-endian, with typed server messages

use crate::audio::AudioStreamPacket;
use crate::{Error, Result};

const V2_HEADER_LEN: usize = 16;
const V3_HEADER_LEN: usize = 4;

/// Version 3 message types
pub mod kind {
    pub const AUDIO: u8 = 0x00;
    pub const ERROR: u8 = 0x0F;
    pub const AUDIO_START: u8 = 0x10;
    pub const AUDIO_DATA: u8 = 0x11;
    pub const AUDIO_END: u8 = 0x12;
    pub const TEXT_ASR: u8 = 0x20;
    pub const TEXT_LLM: u8 = 0x21;
    pub const EMOTION_UPDATE: u8 = 0x38;
}

/// A decoded inbound binary frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// Codec payload for playback
    Audio { timestamp: u32, payload: Vec<u8> },

    /// Server audio stream begins
    AudioStart,

    /// Server audio stream ends
    AudioEnd,

    /// Recognized user text (JSON payload)
    AsrText(String),

    /// Assistant text (JSON payload)
    LlmText(String),

    /// Server-side failure description
    Error(String),

    /// Emotion asset update (JSON payload)
    Emotion(String),

    /// Type this client does not understand
    Unknown(u8),
}

/// Frame an outbound packet for the given protocol version
///
/// # Errors
///
/// Returns error if the payload does not fit the version's size field
pub fn encode_audio(version: u8, packet: &AudioStreamPacket) -> Result<Vec<u8>> {
    let payload = &packet.payload;
    let too_large = |_| {
        Error::Protocol(format!(
            "audio payload of {} bytes exceeds the v{version} size field",
            payload.len()
        ))
    };
    Ok(match version {
        2 => {
            let mut out = Vec::with_capacity(V2_HEADER_LEN + payload.len());
            out.extend_from_slice(&u16::from(version).to_be_bytes());
            out.extend_from_slice(&0u16.to_be_bytes());
            out.extend_from_slice(&0u32.to_be_bytes());
            out.extend_from_slice(&packet.timestamp.to_be_bytes());
            let size = u32::try_from(payload.len()).map_err(too_large)?;
            out.extend_from_slice(&size.to_be_bytes());
            out.extend_from_slice(payload);
            out
        }
        3 => {
            let mut out = Vec::with_capacity(V3_HEADER_LEN + payload.len());
            out.push(kind::AUDIO);
            out.push(0);
            let size = u16::try_from(payload.len()).map_err(too_large)?;
            out.extend_from_slice(&size.to_be_bytes());
            out.extend_from_slice(payload);
            out
        }
        _ => payload.clone(),
    })
}

/// Decode an inbound binary frame
///
/// # Errors
///
/// Returns error if a header is truncated or declares more payload than present
pub fn decode_binary(version: u8, data: &[u8]) -> Result<InboundFrame> {
    match version {
        2 => {
            let header = data
                .get(..V2_HEADER_LEN)
                .ok_or_else(|| Error::Protocol(format!("v2 frame too short: {}", data.len())))?;
            let timestamp = u32::from_be_bytes([header[8], header[9], header[10], header[11]]);
            let size = u32::from_be_bytes([header[12], header[13], header[14], header[15]]) as usize;
            let payload = payload(data, V2_HEADER_LEN, size)?;
            Ok(InboundFrame::Audio {
                timestamp,
                payload: payload.to_vec(),
            })
        }
        3 => {
            let header = data
                .get(..V3_HEADER_LEN)
                .ok_or_else(|| Error::Protocol(format!("v3 frame too short: {}", data.len())))?;
            let msg_type = header[0];
            let size = usize::from(u16::from_be_bytes([header[2], header[3]]));
            let payload = payload(data, V3_HEADER_LEN, size)?;
            let text = || String::from_utf8_lossy(payload).into_owned();

            Ok(match msg_type {
                kind::AUDIO | kind::AUDIO_DATA => InboundFrame::Audio {
                    timestamp: 0,
                    payload: payload.to_vec(),
                },
                kind::AUDIO_START => InboundFrame::AudioStart,
                kind::AUDIO_END => InboundFrame::AudioEnd,
                kind::TEXT_ASR => InboundFrame::AsrText(text()),
                kind::TEXT_LLM => InboundFrame::LlmText(text()),
                kind::ERROR => InboundFrame::Error(text()),
                kind::EMOTION_UPDATE => InboundFrame::Emotion(text()),
                other => InboundFrame::Unknown(other),
            })
        }
        _ => Ok(InboundFrame::Audio {
            timestamp: 0,
            payload: data.to_vec(),
        }),
    }
}

fn payload(data: &[u8], offset: usize, size: usize) -> Result<&[u8]> {
    data.get(offset..offset + size).ok_or_else(|| {
        Error::Protocol(format!(
            "frame declares {size} payload bytes but carries {}",
            data.len().saturating_sub(offset)
        ))
    })
}
