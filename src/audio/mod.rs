//! Audio pipeline
//!
//! Capture, codec and output units around five bounded queues, plus the
//! hardware, codec, wake word and voice processor capabilities they use.

mod codec;
mod hardware;
mod host;
mod packet;
mod pipeline;
mod processor;
mod queues;
mod resample;
pub mod sound;
mod vad;
mod wake_word;

pub use codec::{CodecKind, Decoder, Encoder, Pcm16Codec, create_decoder, create_encoder};
pub use hardware::AudioHardware;
pub use host::{CpalHardware, samples_to_wav};
pub use packet::{AudioStreamPacket, CAPTURE_SAMPLE_RATE, PendingTask, PlaybackFrame};
pub use pipeline::{AudioEvent, AudioService, AudioStats};
pub(crate) use pipeline::sampled;
pub use processor::{AudioProcessor, PassthroughProcessor, ProcessorOutput};
pub use queues::{BoundedQueue, PipelineState, PlaybackGate};
pub use resample::Resampler;
pub use sound::{SoundBank, SoundClip, SoundFormat};
pub use vad::{EnergyVad, calculate_rms};
pub use wake_word::{DetectorState, EnergyWakeWord, WakeWord};
