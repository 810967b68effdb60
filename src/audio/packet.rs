//! Audio data units moved between pipeline stages

/// Sample rate of everything captured from the microphone and sent upstream
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;

/// One compressed frame travelling to or from the speech service
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AudioStreamPacket {
    /// Sample rate the payload decodes to
    pub sample_rate: u32,

    /// Duration of the payload in milliseconds
    pub frame_duration_ms: u32,

    /// Playback timestamp used for round-trip echo correlation (0 = none)
    pub timestamp: u32,

    /// Compressed codec payload
    pub payload: Vec<u8>,
}

impl AudioStreamPacket {
    /// Create a packet with no timestamp
    #[must_use]
    pub const fn new(sample_rate: u32, frame_duration_ms: u32, payload: Vec<u8>) -> Self {
        Self {
            sample_rate,
            frame_duration_ms,
            timestamp: 0,
            payload,
        }
    }
}

/// A decoded frame waiting for the speaker
#[derive(Debug, Clone, Default)]
pub struct PlaybackFrame {
    /// PCM at the hardware output rate
    pub pcm: Vec<i16>,

    /// Timestamp of the packet it was decoded from
    pub timestamp: u32,
}

/// Capture work item for the codec unit
#[derive(Debug, Clone)]
pub enum PendingTask {
    /// Compress a captured frame for the uplink
    EncodeForSend { pcm: Vec<i16>, timestamp: u32 },

    /// Compress a captured frame into the loopback test queue
    EncodeForLoopbackTest { pcm: Vec<i16> },
}

impl PendingTask {
    /// Short label for logs
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::EncodeForSend { .. } => "encode_send",
            Self::EncodeForLoopbackTest { .. } => "encode_test",
        }
    }
}
