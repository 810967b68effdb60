//! Audio streaming pipeline
//!
//! Three threads move audio between the hardware, the codec and the network
//! queues:
//!
//! - capture reads the microphone and routes each frame to exactly one of
//!   the loopback test, the wake word detector or the voice processor
//! - codec performs at most one decode and one encode per wake and is the
//!   only owner of encoder, decoder and output resampler
//! - output drives the [`PlaybackGate`] and writes decoded frames to the speaker
//!
//! A fourth thread powers idle input/output paths down. All five queues and the
//! gate share one mutex and condvar; capture modes live behind a second pair.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use super::codec::{self, CodecKind, Decoder, Encoder};
use super::hardware::AudioHardware;
use super::packet::{AudioStreamPacket, CAPTURE_SAMPLE_RATE, PendingTask, PlaybackFrame};
use super::processor::{AudioProcessor, ProcessorOutput};
use super::queues::{BoundedQueue, PipelineState, PlaybackGate};
use super::resample::Resampler;
use super::sound::SoundClip;
use super::wake_word::WakeWord;
use crate::config::AudioConfig;
use crate::{Error, Result};

const MODE_TESTING: u8 = 1 << 0;
const MODE_WAKE_WORD: u8 = 1 << 1;
const MODE_PROCESSOR: u8 = 1 << 2;

/// Notifications from the pipeline to the control loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioEvent {
    /// A packet is waiting in the send queue
    SendQueueAvailable,

    /// The wake word detector fired
    WakeWordDetected(String),

    /// Speech started (`true`) or ended (`false`)
    VoiceActivity(bool),

    /// Playback drained after an idle notification was requested
    PlaybackIdle,
}

/// Snapshot of queue occupancy and counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AudioStats {
    pub state: PipelineState,
    pub encode_queue: usize,
    pub decode_queue: usize,
    pub send_queue: usize,
    pub playback_queue: usize,
    pub test_queue: usize,
    pub encoded: u64,
    pub decoded: u64,
    pub played: u64,
    pub decode_dropped: u64,
    pub decode_errors: u64,
    pub send_dropped: u64,
}

#[derive(Debug, Default)]
struct Counters {
    encoded: u64,
    decoded: u64,
    played: u64,
    decode_dropped: u64,
    decode_errors: u64,
    send_dropped: u64,
}

struct Queues {
    encode: BoundedQueue<PendingTask>,
    decode: BoundedQueue<AudioStreamPacket>,
    send: BoundedQueue<AudioStreamPacket>,
    playback: BoundedQueue<PlaybackFrame>,
    test: BoundedQueue<AudioStreamPacket>,
    gate: PlaybackGate,
    timestamps: VecDeque<u32>,
    decoding: bool,
    idle_requested: bool,
    codec_reset_pending: bool,
    running: bool,
    last_input: Instant,
    last_output: Instant,
    counters: Counters,
}

impl Queues {
    fn new(config: &AudioConfig) -> Self {
        Self {
            encode: BoundedQueue::new(config.encode_queue_depth),
            decode: BoundedQueue::new(config.decode_queue_depth),
            send: BoundedQueue::new(config.send_queue_depth),
            playback: BoundedQueue::new(config.playback_queue_depth),
            test: BoundedQueue::new(config.test_queue_depth()),
            gate: PlaybackGate::new(config.buffer_start_frames, config.buffer_resume_frames),
            timestamps: VecDeque::new(),
            decoding: false,
            idle_requested: false,
            codec_reset_pending: false,
            running: false,
            last_input: Instant::now(),
            last_output: Instant::now(),
            counters: Counters::default(),
        }
    }

    /// Frames either queued for or in the middle of decoding, plus decoded ones
    fn buffered(&self) -> usize {
        self.decode.len() + self.playback.len() + usize::from(self.decoding)
    }

    fn downlink_empty(&self) -> bool {
        self.decode.is_empty() && self.playback.is_empty() && !self.decoding
    }

    fn codec_has_work(&self) -> bool {
        self.codec_reset_pending
            || (!self.encode.is_empty() && !self.send.is_full())
            || (!self.decode.is_empty() && !self.playback.is_full())
    }

    fn clear_all(&mut self) {
        self.encode.clear();
        self.decode.clear();
        self.send.clear();
        self.playback.clear();
        self.test.clear();
        self.timestamps.clear();
        self.gate.reset();
    }
}

struct Modes {
    bits: u8,
    warmup: bool,
    running: bool,
}

struct Shared {
    config: AudioConfig,
    hardware: Arc<dyn AudioHardware>,
    queues: Mutex<Queues>,
    queue_cv: Condvar,
    modes: Mutex<Modes>,
    modes_cv: Condvar,
    wake_word: Mutex<Box<dyn WakeWord>>,
    processor: Mutex<Box<dyn AudioProcessor>>,
    events: mpsc::UnboundedSender<AudioEvent>,
    server_aec: AtomicBool,
    last_wake_word: Mutex<Option<String>>,
}

impl Shared {
    fn queues(&self) -> MutexGuard<'_, Queues> {
        // A panicked pipeline thread must not take the control loop down with it
        self.queues
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn modes(&self) -> MutexGuard<'_, Modes> {
        self.modes
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn wake_word(&self) -> MutexGuard<'_, Box<dyn WakeWord>> {
        self.wake_word
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn processor(&self) -> MutexGuard<'_, Box<dyn AudioProcessor>> {
        self.processor
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn emit(&self, event: AudioEvent) {
        // The receiver is gone only during shutdown
        let _ = self.events.send(event);
    }

    fn set_mode(&self, bit: u8, enable: bool) {
        let mut modes = self.modes();
        if enable {
            modes.bits |= bit;
            modes.warmup = true;
        } else {
            modes.bits &= !bit;
        }
        self.modes_cv.notify_all();
    }

    /// Push a captured frame, blocking until the encode queue has room
    fn push_encode_task(&self, task: PendingTask) {
        let mut q = self.queues();
        q = self
            .queue_cv
            .wait_while(q, |q| q.running && q.encode.is_full())
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if !q.running {
            return;
        }

        let task = match task {
            PendingTask::EncodeForSend { pcm, mut timestamp } => {
                if let Some(&head) = q.timestamps.front() {
                    if q.timestamps.len() <= self.config.max_timestamps {
                        timestamp = head;
                    } else {
                        tracing::warn!(
                            queued = q.timestamps.len(),
                            "timestamp queue is full, dropping timestamp"
                        );
                    }
                    q.timestamps.pop_front();
                }
                PendingTask::EncodeForSend { pcm, timestamp }
            }
            other => other,
        };

        let _ = q.encode.try_push(task);
        self.queue_cv.notify_all();
    }

    fn enable_audio_testing(&self, enable: bool) {
        self.set_mode(MODE_TESTING, enable);
        if enable {
            tracing::info!("audio testing started");
            return;
        }

        let mut q = self.queues();
        let mut moved = 0usize;
        let packets: Vec<_> = q.test.drain().collect();
        for packet in packets {
            if q.decode.try_push(packet).is_ok() {
                moved += 1;
            }
        }
        self.queue_cv.notify_all();
        tracing::info!(packets = moved, "audio testing stopped, playing back recording");
    }
}

/// Codec state owned by the codec thread
struct CodecUnit {
    kind: CodecKind,
    encoder: Box<dyn Encoder>,
    decoder: Option<Box<dyn Decoder>>,
    output: Resampler,
    output_rate: u32,
}

impl CodecUnit {
    fn new(kind: CodecKind, output_rate: u32) -> Result<Self> {
        Ok(Self {
            kind,
            encoder: codec::create_encoder(kind, CAPTURE_SAMPLE_RATE)?,
            decoder: None,
            output: Resampler::new(CAPTURE_SAMPLE_RATE, output_rate),
            output_rate,
        })
    }

    fn reset(&mut self) {
        self.encoder.reset();
        if let Some(decoder) = self.decoder.as_mut() {
            decoder.reset();
        }
        self.output.reset();
    }

    fn decode(&mut self, packet: &AudioStreamPacket) -> Result<Vec<i16>> {
        let reconfigure = self.decoder.as_ref().is_none_or(|d| {
            d.sample_rate() != packet.sample_rate || d.frame_duration_ms() != packet.frame_duration_ms
        });
        if reconfigure {
            tracing::debug!(
                sample_rate = packet.sample_rate,
                frame_duration_ms = packet.frame_duration_ms,
                "reconfiguring decoder"
            );
            self.decoder = Some(codec::create_decoder(
                self.kind,
                packet.sample_rate,
                packet.frame_duration_ms,
            )?);
            if self.output.from_rate() != packet.sample_rate {
                self.output = Resampler::new(packet.sample_rate, self.output_rate);
            }
        }

        let decoder = self
            .decoder
            .as_mut()
            .ok_or_else(|| Error::Codec("decoder unavailable".to_string()))?;
        let pcm = decoder.decode(&packet.payload)?;
        self.output.process(&pcm)
    }
}

/// Resamplers converting native capture audio to 16 kHz
struct CaptureConverter {
    mic: Resampler,
    reference: Resampler,
}

/// The audio pipeline
pub struct AudioService {
    shared: Arc<Shared>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl AudioService {
    /// Build the pipeline without starting any threads
    pub fn new(
        config: AudioConfig,
        hardware: Arc<dyn AudioHardware>,
        wake_word: Box<dyn WakeWord>,
        processor: Box<dyn AudioProcessor>,
        events: mpsc::UnboundedSender<AudioEvent>,
    ) -> Self {
        hardware.set_output_volume(config.output_volume);

        let shared = Arc::new(Shared {
            queues: Mutex::new(Queues::new(&config)),
            queue_cv: Condvar::new(),
            modes: Mutex::new(Modes {
                bits: 0,
                warmup: false,
                running: false,
            }),
            modes_cv: Condvar::new(),
            wake_word: Mutex::new(wake_word),
            processor: Mutex::new(processor),
            events,
            server_aec: AtomicBool::new(false),
            last_wake_word: Mutex::new(None),
            config,
            hardware,
        });

        Self {
            shared,
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the capture, codec, output and power threads
    ///
    /// # Errors
    ///
    /// Returns error if the codec cannot be created or a thread fails to spawn
    pub fn start(&self) -> Result<()> {
        let mut threads = self
            .threads
            .lock()
            .map_err(|_| Error::Audio("thread list lock poisoned".to_string()))?;
        if !threads.is_empty() {
            return Ok(());
        }

        let codec = CodecUnit::new(
            self.shared.config.codec,
            self.shared.hardware.output_sample_rate(),
        )?;

        self.shared.queues().running = true;
        self.shared.modes().running = true;

        let spawn = |name: &str, f: Box<dyn FnOnce() + Send>| {
            thread::Builder::new()
                .name(name.to_string())
                .spawn(f)
                .map_err(|e| Error::Audio(format!("failed to spawn {name}: {e}")))
        };

        let s = Arc::clone(&self.shared);
        threads.push(spawn("beacon-audio-input", Box::new(move || input_loop(&s)))?);
        let s = Arc::clone(&self.shared);
        threads.push(spawn(
            "beacon-audio-codec",
            Box::new(move || codec_loop(&s, codec)),
        )?);
        let s = Arc::clone(&self.shared);
        threads.push(spawn("beacon-audio-output", Box::new(move || output_loop(&s)))?);
        let s = Arc::clone(&self.shared);
        threads.push(spawn("beacon-audio-power", Box::new(move || power_loop(&s)))?);

        tracing::info!(
            codec = %self.shared.config.codec,
            input_rate = self.shared.hardware.input_sample_rate(),
            output_rate = self.shared.hardware.output_sample_rate(),
            "audio service started"
        );
        Ok(())
    }

    /// Stop every thread and clear all queues
    pub fn stop(&self) {
        {
            let mut q = self.shared.queues();
            q.running = false;
            q.clear_all();
            self.shared.queue_cv.notify_all();
        }
        {
            let mut modes = self.shared.modes();
            modes.running = false;
            self.shared.modes_cv.notify_all();
        }

        let handles: Vec<_> = match self.threads.lock() {
            Ok(mut threads) => threads.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        if handles.is_empty() {
            return;
        }
        for handle in handles {
            let _ = handle.join();
        }
        tracing::info!("audio service stopped");
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.queues().running
    }

    /// Audio hardware in use
    #[must_use]
    pub fn hardware(&self) -> &Arc<dyn AudioHardware> {
        &self.shared.hardware
    }

    #[must_use]
    pub fn config(&self) -> &AudioConfig {
        &self.shared.config
    }

    pub fn enable_wake_word_detection(&self, enable: bool) {
        {
            let mut wake_word = self.shared.wake_word();
            if enable {
                wake_word.start();
            } else {
                wake_word.stop();
            }
        }
        self.shared.set_mode(MODE_WAKE_WORD, enable);
        tracing::debug!(enable, "wake word detection");
    }

    /// Start or stop the voice processor
    ///
    /// Enabling flushes all downlink audio and resets the decoder so nothing is
    /// mid-flight while the capture mode switches.
    pub fn enable_voice_processing(&self, enable: bool) {
        if enable {
            self.reset_decoder();
            self.shared.processor().start();
        } else {
            self.shared.processor().stop();
        }
        self.shared.set_mode(MODE_PROCESSOR, enable);
        tracing::debug!(enable, "voice processing");
    }

    /// Start or stop the loopback test
    ///
    /// Stopping moves the recording into the decode queue for playback.
    pub fn enable_audio_testing(&self, enable: bool) {
        self.shared.enable_audio_testing(enable);
    }

    pub fn enable_device_aec(&self, enable: bool) {
        self.shared.processor().enable_device_aec(enable);
    }

    /// Record played timestamps for server-side echo correlation
    pub fn set_server_aec(&self, enable: bool) {
        self.shared.server_aec.store(enable, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_audio_processor_running(&self) -> bool {
        self.shared.processor().is_running()
    }

    #[must_use]
    pub fn is_wake_word_running(&self) -> bool {
        self.shared.modes().bits & MODE_WAKE_WORD != 0
    }

    #[must_use]
    pub fn is_audio_testing(&self) -> bool {
        self.shared.modes().bits & MODE_TESTING != 0
    }

    #[must_use]
    pub fn wake_word_supports_concurrent(&self) -> bool {
        self.shared.wake_word().supports_concurrent()
    }

    /// Phrase reported by the most recent detection
    #[must_use]
    pub fn last_wake_word(&self) -> Option<String> {
        self.shared
            .last_wake_word
            .lock()
            .ok()
            .and_then(|w| w.clone())
    }

    /// Queue an inbound packet for decoding
    ///
    /// With `wait` false a full queue drops the packet immediately; with `wait`
    /// true the call waits up to the configured timeout first. Returns whether
    /// the packet was accepted.
    pub fn push_packet_to_decode_queue(&self, packet: AudioStreamPacket, wait: bool) -> bool {
        let shared = &self.shared;
        let mut q = shared.queues();

        if q.decode.is_full() && wait {
            q = shared
                .queue_cv
                .wait_timeout_while(q, shared.config.decode_wait_timeout, |q| q.decode.is_full())
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }

        if q.decode.try_push(packet).is_err() {
            q.counters.decode_dropped += 1;
            let dropped = q.counters.decode_dropped;
            drop(q);
            if sampled(dropped) {
                tracing::warn!(dropped, wait, "decode queue full, dropping packet");
            }
            return false;
        }

        shared.queue_cv.notify_all();
        true
    }

    /// Take the oldest encoded packet awaiting transmission
    pub fn pop_packet_from_send_queue(&self) -> Option<AudioStreamPacket> {
        let mut q = self.shared.queues();
        let packet = q.send.pop();
        if packet.is_some() {
            self.shared.queue_cv.notify_all();
        }
        packet
    }

    /// Queue a sound clip for playback at 16 kHz / 60 ms
    pub fn play_sound(&self, clip: &SoundClip) {
        let mut dropped = 0usize;
        for payload in &clip.frames {
            let packet = AudioStreamPacket::new(CAPTURE_SAMPLE_RATE, 60, payload.clone());
            if !self.push_packet_to_decode_queue(packet, true) {
                dropped += 1;
            }
        }
        tracing::debug!(name = %clip.name, frames = clip.frames.len(), dropped, "sound queued");
    }

    /// A server stream is starting; hold playback until the cushion fills
    pub fn start_prebuffering(&self) {
        let mut q = self.shared.queues();
        q.gate.start();
        self.shared.queue_cv.notify_all();
        tracing::debug!(buffered = q.buffered(), "prebuffering started");
    }

    /// The server stream ended; play out whatever is buffered
    pub fn stop_prebuffering(&self) {
        let mut q = self.shared.queues();
        q.gate.finish();
        self.shared.queue_cv.notify_all();
        tracing::debug!(buffered = q.buffered(), state = %q.gate.state(), "prebuffering stopped");
    }

    /// Discard all downlink audio and reset the decoder
    pub fn reset_decoder(&self) {
        let mut q = self.shared.queues();
        q.decode.clear();
        q.playback.clear();
        q.test.clear();
        q.timestamps.clear();
        q.gate.reset();
        q.idle_requested = false;
        q.codec_reset_pending = true;
        self.shared.queue_cv.notify_all();
    }

    /// Reset codec state at the next codec step, keeping queued packets
    pub fn reset_decoder_state(&self) {
        let mut q = self.shared.queues();
        q.codec_reset_pending = true;
        self.shared.queue_cv.notify_all();
    }

    /// Whether every queue is empty and nothing is being decoded
    #[must_use]
    pub fn is_idle(&self) -> bool {
        let q = self.shared.queues();
        q.encode.is_empty() && q.test.is_empty() && q.downlink_empty()
    }

    /// Arm the one-shot playback-idle event
    ///
    /// Returns `true` without arming when playback has already drained.
    pub fn request_playback_idle_notification(&self) -> bool {
        let mut q = self.shared.queues();
        if q.downlink_empty() {
            q.idle_requested = false;
            return true;
        }
        q.idle_requested = true;
        false
    }

    #[must_use]
    pub fn pipeline_state(&self) -> PipelineState {
        self.shared.queues().gate.state()
    }

    #[must_use]
    pub fn stats(&self) -> AudioStats {
        let q = self.shared.queues();
        AudioStats {
            state: q.gate.state(),
            encode_queue: q.encode.len(),
            decode_queue: q.decode.len(),
            send_queue: q.send.len(),
            playback_queue: q.playback.len(),
            test_queue: q.test.len(),
            encoded: q.counters.encoded,
            decoded: q.counters.decoded,
            played: q.counters.played,
            decode_dropped: q.counters.decode_dropped,
            decode_errors: q.counters.decode_errors,
            send_dropped: q.counters.send_dropped,
        }
    }
}

impl Drop for AudioService {
    fn drop(&mut self) {
        self.stop();
    }
}

/// First ten occurrences, then every hundredth
pub(crate) const fn sampled(count: u64) -> bool {
    count <= 10 || count % 100 == 0
}

/// Read `samples` per channel at 16 kHz, interleaved if the input is stereo
fn read_audio(shared: &Shared, conv: &mut CaptureConverter, samples: usize) -> Option<Vec<i16>> {
    let hw = &shared.hardware;
    if !hw.input_enabled() {
        hw.enable_input(true);
    }

    let rate = hw.input_sample_rate();
    let channels = usize::from(hw.input_channels().max(1));
    let native = samples * rate as usize / CAPTURE_SAMPLE_RATE as usize;
    let timeout = Duration::from_millis(u64::from(shared.config.frame_duration_ms) * 2 + 100);

    let data = match hw.read_input(native * channels, timeout) {
        Ok(Some(data)) => data,
        Ok(None) => return None,
        Err(e) => {
            tracing::warn!(error = %e, "audio input read failed");
            thread::sleep(Duration::from_millis(u64::from(shared.config.frame_duration_ms)));
            return None;
        }
    };
    shared.queues().last_input = Instant::now();

    if rate == CAPTURE_SAMPLE_RATE {
        return Some(data);
    }

    let convert = |r: &mut Resampler, pcm: &[i16]| {
        r.process(pcm)
            .map_err(|e| tracing::warn!(error = %e, "capture resample failed"))
            .ok()
    };

    if channels == 2 {
        let mic: Vec<i16> = data.iter().step_by(2).copied().collect();
        let reference: Vec<i16> = data.iter().skip(1).step_by(2).copied().collect();
        let mic = convert(&mut conv.mic, &mic)?;
        let reference = convert(&mut conv.reference, &reference)?;
        Some(
            mic.iter()
                .zip(reference.iter())
                .flat_map(|(&m, &r)| [m, r])
                .collect(),
        )
    } else {
        let mono: Vec<i16> = data.iter().step_by(channels).copied().collect();
        convert(&mut conv.mic, &mono)
    }
}

fn mic_channel(shared: &Shared, data: Vec<i16>) -> Vec<i16> {
    if shared.hardware.input_channels() == 2 {
        data.into_iter().step_by(2).collect()
    } else {
        data
    }
}

fn input_loop(shared: &Shared) {
    let rate = shared.hardware.input_sample_rate();
    let mut conv = CaptureConverter {
        mic: Resampler::new(rate, CAPTURE_SAMPLE_RATE),
        reference: Resampler::new(rate, CAPTURE_SAMPLE_RATE),
    };
    let test_capacity = shared.config.test_queue_depth();

    loop {
        let (bits, warmup) = {
            let modes = shared.modes();
            let mut modes = shared
                .modes_cv
                .wait_while(modes, |m| m.running && m.bits == 0)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if !modes.running {
                break;
            }
            (modes.bits, std::mem::take(&mut modes.warmup))
        };

        // Discard the stale first frame after a mode switch
        if warmup {
            thread::sleep(shared.config.input_warmup);
            continue;
        }

        if bits & MODE_TESTING != 0 {
            if shared.queues().test.len() >= test_capacity {
                tracing::warn!("audio testing queue is full, stopping audio testing");
                shared.enable_audio_testing(false);
                continue;
            }
            if let Some(data) = read_audio(shared, &mut conv, shared.config.frame_samples()) {
                let pcm = mic_channel(shared, data);
                shared.push_encode_task(PendingTask::EncodeForLoopbackTest { pcm });
            }
            continue;
        }

        if bits & MODE_WAKE_WORD != 0 {
            let feed_size = shared.wake_word().feed_size();
            if feed_size > 0 {
                if let Some(data) = read_audio(shared, &mut conv, feed_size) {
                    let pcm = mic_channel(shared, data);
                    let detected = shared.wake_word().feed(&pcm);
                    if let Some(word) = detected {
                        tracing::info!(wake_word = %word, "wake word detected");
                        if let Ok(mut last) = shared.last_wake_word.lock() {
                            *last = Some(word.clone());
                        }
                        shared.emit(AudioEvent::WakeWordDetected(word));
                    }
                }
                continue;
            }
        }

        if bits & MODE_PROCESSOR != 0 {
            let feed_size = shared.processor().feed_size();
            if let Some(data) = read_audio(shared, &mut conv, feed_size) {
                let outputs = shared.processor().feed(data);
                for output in outputs {
                    match output {
                        ProcessorOutput::Frame(pcm) => {
                            shared.push_encode_task(PendingTask::EncodeForSend { pcm, timestamp: 0 });
                        }
                        ProcessorOutput::VoiceActivity(speaking) => {
                            tracing::debug!(speaking, "voice activity changed");
                            shared.emit(AudioEvent::VoiceActivity(speaking));
                        }
                    }
                }
            }
            continue;
        }

        // Wake word only, with a backend that wants no audio
        thread::sleep(Duration::from_millis(u64::from(shared.config.frame_duration_ms)));
    }

    tracing::debug!("audio input thread stopped");
}

fn codec_loop(shared: &Shared, mut codec: CodecUnit) {
    let frame_ms = shared.config.frame_duration_ms;

    loop {
        let (reset, decode_item, encode_item) = {
            let q = shared.queues();
            let mut q = shared
                .queue_cv
                .wait_while(q, |q| q.running && !q.codec_has_work())
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if !q.running {
                break;
            }

            let reset = std::mem::take(&mut q.codec_reset_pending);
            let decode_item = if !q.decode.is_empty() && !q.playback.is_full() {
                let packet = q.decode.pop();
                q.decoding = packet.is_some();
                packet
            } else {
                None
            };
            let encode_item = if !q.encode.is_empty() && !q.send.is_full() {
                q.encode.pop()
            } else {
                None
            };
            shared.queue_cv.notify_all();
            (reset, decode_item, encode_item)
        };

        if reset {
            codec.reset();
            tracing::debug!("codec state reset");
        }

        if let Some(packet) = decode_item {
            let result = codec.decode(&packet);
            let mut q = shared.queues();
            q.decoding = false;
            match result {
                Ok(pcm) if !pcm.is_empty() => {
                    q.counters.decoded += 1;
                    let frame = PlaybackFrame {
                        pcm,
                        timestamp: packet.timestamp,
                    };
                    if q.playback.try_push(frame).is_err() {
                        tracing::warn!("playback queue full, dropping decoded frame");
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    q.counters.decode_errors += 1;
                    let errors = q.counters.decode_errors;
                    if sampled(errors) {
                        tracing::warn!(error = %e, errors, "failed to decode audio");
                    }
                }
            }

            // The last packet produced nothing to play, so the output unit never sees it
            let notify_idle = q.idle_requested && q.downlink_empty();
            if notify_idle {
                q.idle_requested = false;
            }
            shared.queue_cv.notify_all();
            drop(q);
            if notify_idle {
                shared.emit(AudioEvent::PlaybackIdle);
            }
        }

        if let Some(task) = encode_item {
            let kind = task.kind();
            let (pcm, timestamp, to_send) = match task {
                PendingTask::EncodeForSend { pcm, timestamp } => (pcm, timestamp, true),
                PendingTask::EncodeForLoopbackTest { pcm } => (pcm, 0, false),
            };

            match codec.encoder.encode(&pcm) {
                Ok(payload) => {
                    let packet = AudioStreamPacket {
                        sample_rate: CAPTURE_SAMPLE_RATE,
                        frame_duration_ms: frame_ms,
                        timestamp,
                        payload,
                    };
                    let mut q = shared.queues();
                    q.counters.encoded += 1;
                    let pushed = if to_send {
                        q.send.try_push(packet).is_ok()
                    } else {
                        q.test.try_push(packet).is_ok()
                    };
                    if !pushed {
                        q.counters.send_dropped += 1;
                    }
                    shared.queue_cv.notify_all();
                    drop(q);

                    if to_send && pushed {
                        shared.emit(AudioEvent::SendQueueAvailable);
                    }
                }
                Err(e) => tracing::warn!(error = %e, task = kind, "failed to encode audio"),
            }
        }
    }

    tracing::debug!("audio codec thread stopped");
}

fn output_loop(shared: &Shared) {
    let mut slow_writes = 0u64;

    loop {
        let (frame, notify_idle) = {
            let q = shared.queues();
            let mut q = shared
                .queue_cv
                .wait_while(q, |q| {
                    let buffered = q.buffered();
                    q.gate.update(buffered);
                    q.running && !(q.gate.can_play() && !q.playback.is_empty())
                })
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if !q.running {
                break;
            }

            let Some(frame) = q.playback.pop() else {
                continue;
            };
            q.counters.played += 1;
            q.last_output = Instant::now();

            let notify_idle = q.idle_requested && q.downlink_empty();
            if notify_idle {
                q.idle_requested = false;
            }
            shared.queue_cv.notify_all();
            (frame, notify_idle)
        };

        let hw = &shared.hardware;
        if !hw.output_enabled() {
            hw.enable_output(true);
        }

        let started = Instant::now();
        if let Err(e) = hw.write_output(&frame.pcm) {
            tracing::warn!(error = %e, "audio output write failed");
        }
        let frame_budget = Duration::from_millis(u64::from(shared.config.frame_duration_ms));
        if started.elapsed() > frame_budget * 2 {
            slow_writes += 1;
            if sampled(slow_writes) {
                tracing::debug!(
                    elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                    slow_writes,
                    "slow speaker write"
                );
            }
        }

        if shared.server_aec.load(Ordering::Relaxed) && frame.timestamp > 0 {
            let mut q = shared.queues();
            q.timestamps.push_back(frame.timestamp);
            // Bound the history when nothing is captured to consume it
            while q.timestamps.len() > shared.config.max_timestamps * 4 {
                q.timestamps.pop_front();
            }
        }

        if notify_idle {
            shared.emit(AudioEvent::PlaybackIdle);
        }
    }

    tracing::debug!("audio output thread stopped");
}

fn power_loop(shared: &Shared) {
    let interval = shared.config.power_check_interval;
    let timeout = shared.config.power_timeout;

    loop {
        let (input_idle, output_idle) = {
            let q = shared.queues();
            let (q, _) = shared
                .queue_cv
                .wait_timeout_while(q, interval, |q| q.running)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if !q.running {
                break;
            }
            (q.last_input.elapsed() > timeout, q.last_output.elapsed() > timeout)
        };

        let hw = &shared.hardware;
        if input_idle && hw.input_enabled() {
            tracing::debug!("powering down idle audio input");
            hw.enable_input(false);
        }
        if output_idle && hw.output_enabled() {
            tracing::debug!("powering down idle audio output");
            hw.enable_output(false);
        }
    }

    tracing::debug!("audio power thread stopped");
}
