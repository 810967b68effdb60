//! Host audio hardware backed by cpal
//!
//! cpal streams are `!Send` on some platforms, so they live on a dedicated
//! stream thread. The callbacks exchange samples with the pipeline through two
//! sample rings guarded by a mutex and condvar.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, mpsc};
use std::thread;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream, StreamConfig};

use super::hardware::AudioHardware;
use crate::{Error, Result};

/// Preferred capture rate (16kHz for speech)
const PREFERRED_INPUT_RATE: u32 = 16_000;

/// Preferred playback rate (matches common TTS output)
const PREFERRED_OUTPUT_RATE: u32 = 24_000;

/// Seconds of microphone audio kept before the oldest samples are dropped
const INPUT_RING_SECONDS: usize = 2;

/// Milliseconds of speaker audio queued ahead of the callback
const OUTPUT_LEAD_MS: usize = 120;

/// Bounded sample FIFO shared between a cpal callback and a pipeline thread
struct SampleRing {
    samples: Mutex<VecDeque<i16>>,
    changed: Condvar,
    capacity: usize,
}

impl SampleRing {
    fn new(capacity: usize) -> Self {
        Self {
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
            changed: Condvar::new(),
            capacity,
        }
    }

    /// Append from the input callback, dropping the oldest samples when full
    fn push_overwrite(&self, data: impl Iterator<Item = i16>) {
        if let Ok(mut buf) = self.samples.lock() {
            buf.extend(data);
            let excess = buf.len().saturating_sub(self.capacity);
            if excess > 0 {
                buf.drain(..excess);
            }
            self.changed.notify_all();
        }
    }

    fn clear(&self) {
        if let Ok(mut buf) = self.samples.lock() {
            buf.clear();
            self.changed.notify_all();
        }
    }
}

enum StreamCommand {
    EnableInput {
        enable: bool,
        reply: mpsc::Sender<Result<()>>,
    },
    EnableOutput {
        enable: bool,
        reply: mpsc::Sender<Result<()>>,
    },
    Shutdown,
}

/// Default host input/output devices
pub struct CpalHardware {
    input_config: StreamConfig,
    output_config: StreamConfig,
    input_ring: Arc<SampleRing>,
    output_ring: Arc<SampleRing>,
    input_on: AtomicBool,
    output_on: AtomicBool,
    volume: Arc<AtomicU8>,
    cmd_tx: Mutex<mpsc::Sender<StreamCommand>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl CpalHardware {
    /// Open the default input and output devices
    ///
    /// # Errors
    ///
    /// Returns error if either device cannot be opened
    pub fn new() -> Result<Self> {
        let host = cpal::default_host();

        let input = host
            .default_input_device()
            .ok_or_else(|| Error::Audio("no input device available".to_string()))?;
        let output = host
            .default_output_device()
            .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

        let input_config = preferred_input_config(&input)?;
        let output_config = preferred_output_config(&output)?;

        tracing::debug!(
            input_device = input.name().unwrap_or_default(),
            input_rate = input_config.sample_rate.0,
            input_channels = input_config.channels,
            output_device = output.name().unwrap_or_default(),
            output_rate = output_config.sample_rate.0,
            output_channels = output_config.channels,
            "audio hardware initialized"
        );

        let input_capacity = input_config.sample_rate.0 as usize
            * usize::from(input_config.channels)
            * INPUT_RING_SECONDS;
        let output_capacity = output_config.sample_rate.0 as usize * OUTPUT_LEAD_MS / 1000;

        let input_ring = Arc::new(SampleRing::new(input_capacity));
        let output_ring = Arc::new(SampleRing::new(output_capacity));
        let volume = Arc::new(AtomicU8::new(70));

        let (cmd_tx, cmd_rx) = mpsc::channel::<StreamCommand>();
        let thread = {
            let input_config = input_config.clone();
            let output_config = output_config.clone();
            let input_ring = Arc::clone(&input_ring);
            let output_ring = Arc::clone(&output_ring);
            let volume = Arc::clone(&volume);
            thread::Builder::new()
                .name("beacon-audio-streams".into())
                .spawn(move || {
                    run_stream_thread(
                        &cmd_rx,
                        &input_config,
                        &output_config,
                        &input_ring,
                        &output_ring,
                        &volume,
                    );
                })
                .map_err(|e| Error::Audio(format!("failed to spawn stream thread: {e}")))?
        };

        Ok(Self {
            input_config,
            output_config,
            input_ring,
            output_ring,
            input_on: AtomicBool::new(false),
            output_on: AtomicBool::new(false),
            volume,
            cmd_tx: Mutex::new(cmd_tx),
            thread: Some(thread),
        })
    }

    fn request(&self, make: impl FnOnce(mpsc::Sender<Result<()>>) -> StreamCommand) -> Result<()> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.cmd_tx
            .lock()
            .map_err(|_| Error::Audio("stream command lock poisoned".to_string()))?
            .send(make(reply_tx))
            .map_err(|_| Error::Audio("stream thread stopped".to_string()))?;
        reply_rx
            .recv()
            .map_err(|_| Error::Audio("stream thread stopped".to_string()))?
    }
}

impl AudioHardware for CpalHardware {
    fn input_sample_rate(&self) -> u32 {
        self.input_config.sample_rate.0
    }

    fn output_sample_rate(&self) -> u32 {
        self.output_config.sample_rate.0
    }

    fn input_channels(&self) -> u16 {
        self.input_config.channels
    }

    fn read_input(&self, samples: usize, timeout: Duration) -> Result<Option<Vec<i16>>> {
        let guard = self
            .input_ring
            .samples
            .lock()
            .map_err(|_| Error::Audio("input ring lock poisoned".to_string()))?;
        let (mut buf, _) = self
            .input_ring
            .changed
            .wait_timeout_while(guard, timeout, |b| b.len() < samples)
            .map_err(|_| Error::Audio("input ring lock poisoned".to_string()))?;

        if buf.len() < samples {
            return Ok(None);
        }
        Ok(Some(buf.drain(..samples).collect()))
    }

    fn write_output(&self, pcm: &[i16]) -> Result<()> {
        let ring = &self.output_ring;
        let guard = ring
            .samples
            .lock()
            .map_err(|_| Error::Audio("output ring lock poisoned".to_string()))?;
        // Block until the callback has consumed enough to take this frame
        let room = ring.capacity.saturating_sub(pcm.len());
        let (mut buf, timed_out) = ring
            .changed
            .wait_timeout_while(guard, Duration::from_secs(1), |b| b.len() > room)
            .map_err(|_| Error::Audio("output ring lock poisoned".to_string()))?;
        if timed_out.timed_out() && buf.len() > room {
            return Err(Error::Audio("speaker stalled".to_string()));
        }
        buf.extend(pcm.iter().copied());
        Ok(())
    }

    fn enable_input(&self, enable: bool) {
        if self.input_on.load(Ordering::Acquire) == enable {
            return;
        }
        match self.request(|reply| StreamCommand::EnableInput { enable, reply }) {
            Ok(()) => {
                self.input_on.store(enable, Ordering::Release);
                if !enable {
                    self.input_ring.clear();
                }
                tracing::debug!(enable, "audio input power changed");
            }
            Err(e) => tracing::error!(error = %e, enable, "failed to switch audio input"),
        }
    }

    fn enable_output(&self, enable: bool) {
        if self.output_on.load(Ordering::Acquire) == enable {
            return;
        }
        match self.request(|reply| StreamCommand::EnableOutput { enable, reply }) {
            Ok(()) => {
                self.output_on.store(enable, Ordering::Release);
                if !enable {
                    self.output_ring.clear();
                }
                tracing::debug!(enable, "audio output power changed");
            }
            Err(e) => tracing::error!(error = %e, enable, "failed to switch audio output"),
        }
    }

    fn input_enabled(&self) -> bool {
        self.input_on.load(Ordering::Acquire)
    }

    fn output_enabled(&self) -> bool {
        self.output_on.load(Ordering::Acquire)
    }

    fn set_output_volume(&self, volume: u8) {
        self.volume.store(volume.min(100), Ordering::Relaxed);
    }

    fn output_volume(&self) -> u8 {
        self.volume.load(Ordering::Relaxed)
    }
}

impl Drop for CpalHardware {
    fn drop(&mut self) {
        if let Ok(tx) = self.cmd_tx.lock() {
            let _ = tx.send(StreamCommand::Shutdown);
        }
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

fn preferred_input_config(device: &cpal::Device) -> Result<StreamConfig> {
    let mono_16k = device
        .supported_input_configs()
        .map_err(|e| Error::Audio(e.to_string()))?
        .find(|c| {
            c.channels() == 1
                && c.min_sample_rate() <= SampleRate(PREFERRED_INPUT_RATE)
                && c.max_sample_rate() >= SampleRate(PREFERRED_INPUT_RATE)
        });

    if let Some(config) = mono_16k {
        return Ok(config
            .with_sample_rate(SampleRate(PREFERRED_INPUT_RATE))
            .config());
    }

    // Fall back to whatever the device prefers; the pipeline resamples
    device
        .default_input_config()
        .map(|c| c.config())
        .map_err(|e| Error::Audio(format!("no suitable input config: {e}")))
}

fn preferred_output_config(device: &cpal::Device) -> Result<StreamConfig> {
    let rate = SampleRate(PREFERRED_OUTPUT_RATE);
    let supported = device
        .supported_output_configs()
        .map_err(|e| Error::Audio(e.to_string()))?
        .collect::<Vec<_>>();

    let pick = |channels: u16| {
        supported
            .iter()
            .find(|c| c.channels() == channels && c.min_sample_rate() <= rate && c.max_sample_rate() >= rate)
            .cloned()
    };

    if let Some(config) = pick(1).or_else(|| pick(2)) {
        return Ok(config.with_sample_rate(rate).config());
    }

    device
        .default_output_config()
        .map(|c| c.config())
        .map_err(|e| Error::Audio(format!("no suitable output config: {e}")))
}

#[allow(clippy::needless_pass_by_value)]
fn run_stream_thread(
    cmd_rx: &mpsc::Receiver<StreamCommand>,
    input_config: &StreamConfig,
    output_config: &StreamConfig,
    input_ring: &Arc<SampleRing>,
    output_ring: &Arc<SampleRing>,
    volume: &Arc<AtomicU8>,
) {
    let host = cpal::default_host();
    let mut input_stream: Option<Stream> = None;
    let mut output_stream: Option<Stream> = None;

    while let Ok(cmd) = cmd_rx.recv() {
        match cmd {
            StreamCommand::EnableInput { enable, reply } => {
                let result = if enable {
                    build_input_stream(&host, input_config, input_ring).map(|s| {
                        input_stream = Some(s);
                    })
                } else {
                    input_stream = None;
                    Ok(())
                };
                let _ = reply.send(result);
            }
            StreamCommand::EnableOutput { enable, reply } => {
                let result = if enable {
                    build_output_stream(&host, output_config, output_ring, volume).map(|s| {
                        output_stream = Some(s);
                    })
                } else {
                    output_stream = None;
                    Ok(())
                };
                let _ = reply.send(result);
            }
            StreamCommand::Shutdown => break,
        }
    }

    drop(input_stream);
    drop(output_stream);
    tracing::debug!("audio stream thread stopped");
}

fn build_input_stream(
    host: &cpal::Host,
    config: &StreamConfig,
    ring: &Arc<SampleRing>,
) -> Result<Stream> {
    let device = host
        .default_input_device()
        .ok_or_else(|| Error::Audio("no input device".to_string()))?;

    let ring = Arc::clone(ring);
    let stream = device
        .build_input_stream(
            config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                ring.push_overwrite(data.iter().map(|&s| f32_to_i16(s)));
            },
            |err| {
                tracing::error!(error = %err, "audio capture error");
            },
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))?;

    stream.play().map_err(|e| Error::Audio(e.to_string()))?;
    Ok(stream)
}

fn build_output_stream(
    host: &cpal::Host,
    config: &StreamConfig,
    ring: &Arc<SampleRing>,
    volume: &Arc<AtomicU8>,
) -> Result<Stream> {
    let device = host
        .default_output_device()
        .ok_or_else(|| Error::Audio("no output device".to_string()))?;

    let channels = usize::from(config.channels);
    let ring = Arc::clone(ring);
    let volume = Arc::clone(volume);
    let stream = device
        .build_output_stream(
            config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let gain = f32::from(volume.load(Ordering::Relaxed)) / 100.0;
                let Ok(mut buf) = ring.samples.lock() else {
                    data.fill(0.0);
                    return;
                };
                for frame in data.chunks_mut(channels) {
                    let sample = buf.pop_front().map_or(0.0, |s| f32::from(s) / 32768.0) * gain;
                    frame.fill(sample);
                }
                ring.changed.notify_all();
            },
            |err| {
                tracing::error!(error = %err, "audio playback error");
            },
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))?;

    stream.play().map_err(|e| Error::Audio(e.to_string()))?;
    Ok(stream)
}

#[allow(clippy::cast_possible_truncation)]
fn f32_to_i16(sample: f32) -> i16 {
    (sample * 32767.0).clamp(-32768.0, 32767.0) as i16
}

/// Convert 16-bit samples to WAV bytes
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[i16], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for &sample in samples {
            writer
                .write_sample(sample)
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_ring_drops_oldest() {
        let ring = SampleRing::new(4);
        ring.push_overwrite([1, 2, 3, 4, 5, 6].into_iter());
        let buf = ring.samples.lock().unwrap();
        assert_eq!(buf.iter().copied().collect::<Vec<_>>(), vec![3, 4, 5, 6]);
    }

    #[test]
    fn test_f32_conversion_clamps() {
        assert_eq!(f32_to_i16(2.0), i16::MAX);
        assert_eq!(f32_to_i16(-2.0), i16::MIN);
        assert_eq!(f32_to_i16(0.0), 0);
    }
}
