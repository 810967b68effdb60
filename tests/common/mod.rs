//! Shared test utilities
//!
//! Fake hardware, protocol and peripherals that record what the device does

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use beacon_device::audio::{
    AudioEvent, AudioHardware, AudioService, AudioStreamPacket, CAPTURE_SAMPLE_RATE, Encoder,
    PassthroughProcessor, Pcm16Codec, SoundBank, WakeWord,
};
use beacon_device::config::{Config, ReconnectPolicy};
use beacon_device::device::{Board, Display, DisplayMode, Led, McpHandler, Peripherals};
use beacon_device::{Application, DeviceState, Error, Protocol, ProtocolEvent, Result};

/// Ordered log shared between fakes, for asserting cross-component order
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn record(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    #[must_use]
    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    /// Entries recorded after the last occurrence of `marker`
    #[must_use]
    pub fn since(&self, marker: &str) -> Vec<String> {
        let entries = self.entries();
        let start = entries
            .iter()
            .rposition(|e| e == marker)
            .map_or(0, |i| i + 1);
        entries[start..].to_vec()
    }
}

/// 16 kHz mono hardware that captures silence in real time and records writes
#[derive(Debug)]
pub struct FakeHardware {
    write_delay: Duration,
    written: AtomicUsize,
    reads: AtomicUsize,
    input_enabled: AtomicBool,
    output_enabled: AtomicBool,
    volume: AtomicU8,
}

impl FakeHardware {
    #[must_use]
    pub fn new() -> Self {
        Self::with_write_delay(Duration::from_millis(5))
    }

    /// Each speaker write takes `delay`
    #[must_use]
    pub fn with_write_delay(delay: Duration) -> Self {
        Self {
            write_delay: delay,
            written: AtomicUsize::new(0),
            reads: AtomicUsize::new(0),
            input_enabled: AtomicBool::new(false),
            output_enabled: AtomicBool::new(false),
            volume: AtomicU8::new(0),
        }
    }

    #[must_use]
    pub fn frames_written(&self) -> usize {
        self.written.load(Ordering::SeqCst)
    }

    /// Microphone reads completed so far
    #[must_use]
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

impl AudioHardware for FakeHardware {
    fn input_sample_rate(&self) -> u32 {
        CAPTURE_SAMPLE_RATE
    }

    fn output_sample_rate(&self) -> u32 {
        CAPTURE_SAMPLE_RATE
    }

    fn input_channels(&self) -> u16 {
        1
    }

    fn read_input(&self, samples: usize, timeout: Duration) -> Result<Option<Vec<i16>>> {
        let realtime = Duration::from_millis(samples as u64 * 1000 / u64::from(CAPTURE_SAMPLE_RATE));
        std::thread::sleep(realtime.min(timeout));
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(Some(vec![0; samples]))
    }

    fn write_output(&self, _pcm: &[i16]) -> Result<()> {
        std::thread::sleep(self.write_delay);
        self.written.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn enable_input(&self, enable: bool) {
        self.input_enabled.store(enable, Ordering::SeqCst);
    }

    fn enable_output(&self, enable: bool) {
        self.output_enabled.store(enable, Ordering::SeqCst);
    }

    fn input_enabled(&self) -> bool {
        self.input_enabled.load(Ordering::SeqCst)
    }

    fn output_enabled(&self) -> bool {
        self.output_enabled.load(Ordering::SeqCst)
    }

    fn set_output_volume(&self, volume: u8) {
        self.volume.store(volume, Ordering::SeqCst);
    }

    fn output_volume(&self) -> u8 {
        self.volume.load(Ordering::SeqCst)
    }
}

/// Fires queued wake words on the next feeds
#[derive(Debug, Clone, Default)]
pub struct WakeWordTrigger(Arc<Mutex<VecDeque<String>>>);

impl WakeWordTrigger {
    pub fn fire(&self, word: &str) {
        self.0.lock().unwrap().push_back(word.to_string());
    }
}

#[derive(Debug)]
pub struct FakeWakeWord {
    trigger: WakeWordTrigger,
    running: bool,
}

impl FakeWakeWord {
    #[must_use]
    pub fn new(trigger: WakeWordTrigger) -> Self {
        Self {
            trigger,
            running: false,
        }
    }
}

impl WakeWord for FakeWakeWord {
    fn feed_size(&self) -> usize {
        480
    }

    fn feed(&mut self, _pcm: &[i16]) -> Option<String> {
        if !self.running {
            return None;
        }
        self.trigger.0.lock().unwrap().pop_front()
    }

    fn start(&mut self) {
        self.running = true;
    }

    fn stop(&mut self) {
        self.running = false;
    }
}

/// In-memory transport
pub struct FakeProtocol {
    events: mpsc::UnboundedSender<ProtocolEvent>,
    journal: Journal,
    open: AtomicBool,
    fail_next: AtomicU32,
    fail_all: AtomicBool,
    texts: Mutex<Vec<String>>,
    audio: Mutex<Vec<AudioStreamPacket>>,
}

impl FakeProtocol {
    #[must_use]
    pub fn new(events: mpsc::UnboundedSender<ProtocolEvent>, journal: Journal) -> Self {
        Self {
            events,
            journal,
            open: AtomicBool::new(false),
            fail_next: AtomicU32::new(0),
            fail_all: AtomicBool::new(false),
            texts: Mutex::new(Vec::new()),
            audio: Mutex::new(Vec::new()),
        }
    }

    /// Make the next `n` opens fail
    pub fn fail_next_opens(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn fail_all_opens(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    /// Deliver an event as if it came from the network
    pub fn inject(&self, event: ProtocolEvent) {
        self.events.send(event).unwrap();
    }

    /// The server dropped the connection
    pub fn simulate_close(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.journal.record("closed");
        self.inject(ProtocolEvent::AudioChannelClosed);
    }

    /// Every text frame sent, parsed
    #[must_use]
    pub fn messages(&self) -> Vec<Value> {
        self.texts
            .lock()
            .unwrap()
            .iter()
            .map(|t| serde_json::from_str(t).unwrap())
            .collect()
    }

    /// Count `listen` messages with the given state
    #[must_use]
    pub fn listen_count(&self, state: &str) -> usize {
        self.messages()
            .iter()
            .filter(|m| m["type"] == "listen" && m["state"] == state)
            .count()
    }

    #[must_use]
    pub fn audio_sent(&self) -> usize {
        self.audio.lock().unwrap().len()
    }
}

#[async_trait]
impl Protocol for FakeProtocol {
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn open_audio_channel(&self) -> Result<()> {
        let failing = self.fail_all.load(Ordering::SeqCst)
            || self
                .fail_next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        if failing {
            self.journal.record("open:fail");
            return Err(Error::Channel("connection refused".to_string()));
        }
        self.open.store(true, Ordering::SeqCst);
        self.journal.record("open:ok");
        let _ = self.events.send(ProtocolEvent::AudioChannelOpened);
        Ok(())
    }

    async fn close_audio_channel(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.journal.record("close");
    }

    fn is_audio_channel_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send_audio(&self, packet: AudioStreamPacket) -> bool {
        if !self.is_audio_channel_open() {
            return false;
        }
        self.audio.lock().unwrap().push(packet);
        true
    }

    async fn send_text(&self, text: String) -> Result<()> {
        self.texts.lock().unwrap().push(text);
        Ok(())
    }

    fn session_id(&self) -> String {
        "test-session".to_string()
    }

    fn server_sample_rate(&self) -> u32 {
        CAPTURE_SAMPLE_RATE
    }

    fn server_frame_duration(&self) -> u32 {
        60
    }
}

#[derive(Debug, Default)]
pub struct RecordingDisplay {
    pub statuses: Mutex<Vec<String>>,
    pub chats: Mutex<Vec<(String, String)>>,
    pub emotions: Mutex<Vec<String>>,
}

impl RecordingDisplay {
    #[must_use]
    pub fn statuses(&self) -> Vec<String> {
        self.statuses.lock().unwrap().clone()
    }

    #[must_use]
    pub fn chats(&self) -> Vec<(String, String)> {
        self.chats.lock().unwrap().clone()
    }

    #[must_use]
    pub fn emotions(&self) -> Vec<String> {
        self.emotions.lock().unwrap().clone()
    }
}

impl Display for RecordingDisplay {
    fn set_status(&self, status: &str) {
        self.statuses.lock().unwrap().push(status.to_string());
    }

    fn set_chat_message(&self, role: &str, content: &str) {
        if !content.is_empty() {
            self.chats
                .lock()
                .unwrap()
                .push((role.to_string(), content.to_string()));
        }
    }

    fn set_emotion(&self, emotion: &str) {
        self.emotions.lock().unwrap().push(emotion.to_string());
    }

    fn set_display_mode(&self, _mode: DisplayMode) {}
}

#[derive(Debug, Default)]
pub struct RecordingLed(pub Mutex<Vec<DeviceState>>);

impl RecordingLed {
    #[must_use]
    pub fn states(&self) -> Vec<DeviceState> {
        self.0.lock().unwrap().clone()
    }
}

impl Led for RecordingLed {
    fn on_state_changed(&self, state: DeviceState) {
        self.0.lock().unwrap().push(state);
    }
}

#[derive(Debug, Default)]
pub struct RecordingBoard {
    pub journal: Journal,
    pub reboots: AtomicUsize,
}

impl Board for RecordingBoard {
    fn reset_network(&self) -> bool {
        self.journal.record("reset_network");
        true
    }

    fn reboot(&self) {
        self.reboots.fetch_add(1, Ordering::SeqCst);
    }

    fn set_power_save_mode(&self, _enabled: bool) {}
}

#[derive(Debug, Default)]
pub struct RecordingMcp(pub Mutex<Vec<Value>>);

impl McpHandler for RecordingMcp {
    fn handle(&self, payload: &Value) {
        self.0.lock().unwrap().push(payload.clone());
    }
}

/// Configuration with short timings suitable for tests
#[must_use]
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.audio.input_warmup = Duration::from_millis(10);
    config.audio.power_timeout = Duration::from_secs(600);
    config.audio.power_check_interval = Duration::from_millis(100);
    config.device.clock_interval = Duration::from_secs(3600);
    config.reconnect = ReconnectPolicy::FixedInterval {
        interval: Duration::from_millis(30),
        network_reset_threshold: 3,
    };
    config
}

/// Build a pipeline on fake hardware
pub fn audio_service(
    config: &Config,
    hardware: Arc<FakeHardware>,
    trigger: WakeWordTrigger,
) -> (Arc<AudioService>, mpsc::UnboundedReceiver<AudioEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let service = AudioService::new(
        config.audio.clone(),
        hardware,
        Box::new(FakeWakeWord::new(trigger)),
        Box::new(PassthroughProcessor::new(config.audio.frame_samples(), 1)),
        tx,
    );
    (Arc::new(service), rx)
}

/// A device wired to fakes
pub struct Rig {
    pub app: Application,
    pub audio: Arc<AudioService>,
    pub hardware: Arc<FakeHardware>,
    pub protocol: Arc<FakeProtocol>,
    pub trigger: WakeWordTrigger,
    pub display: Arc<RecordingDisplay>,
    pub led: Arc<RecordingLed>,
    pub board: Arc<RecordingBoard>,
    pub mcp: Arc<RecordingMcp>,
    pub journal: Journal,
}

#[must_use]
pub fn rig(config: &Config) -> Rig {
    rig_with_hardware(config, FakeHardware::new())
}

#[must_use]
pub fn rig_with_hardware(config: &Config, hardware: FakeHardware) -> Rig {
    let journal = Journal::default();
    let hardware = Arc::new(hardware);
    let trigger = WakeWordTrigger::default();
    let (audio, audio_rx) = audio_service(config, Arc::clone(&hardware), trigger.clone());

    let (protocol_tx, protocol_rx) = mpsc::unbounded_channel();
    let protocol = Arc::new(FakeProtocol::new(protocol_tx, journal.clone()));

    let display = Arc::new(RecordingDisplay::default());
    let led = Arc::new(RecordingLed::default());
    let board = Arc::new(RecordingBoard {
        journal: journal.clone(),
        reboots: AtomicUsize::new(0),
    });
    let mcp = Arc::new(RecordingMcp::default());

    let peripherals = Peripherals {
        display: display.clone(),
        led: led.clone(),
        board: board.clone(),
        mcp: mcp.clone(),
    };

    let app = Application::new(
        config,
        Arc::clone(&audio),
        protocol.clone(),
        peripherals,
        SoundBank::default(),
        audio_rx,
        protocol_rx,
    );

    Rig {
        app,
        audio,
        hardware,
        protocol,
        trigger,
        display,
        led,
        board,
        mcp,
        journal,
    }
}

/// Drive the control loop until `done` holds or `timeout` elapses
pub async fn run_until(
    app: &mut Application,
    timeout: Duration,
    done: impl Fn(&Application) -> bool,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while !done(app) {
        if tokio::time::timeout_at(deadline, app.run_once()).await.is_err() {
            return done(app);
        }
    }
    true
}

/// Poll `done` until it holds or `timeout` elapses
pub async fn wait_for(timeout: Duration, done: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while !done() {
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    true
}

/// One 60 ms PCM16 packet of a 440 Hz tone
#[must_use]
pub fn tone_packet() -> AudioStreamPacket {
    let samples = generate_sine_samples(440.0, 0.06, 0.3);
    let payload = Pcm16Codec::new(CAPTURE_SAMPLE_RATE, 60).encode(&samples).unwrap();
    AudioStreamPacket::new(CAPTURE_SAMPLE_RATE, 60, payload)
}

/// Generate sine wave samples at the capture rate
#[must_use]
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn generate_sine_samples(frequency: f32, duration_secs: f32, amplitude: f32) -> Vec<i16> {
    let num_samples = (CAPTURE_SAMPLE_RATE as f32 * duration_secs).round() as usize;
    (0..num_samples)
        .map(|i| {
            let t = i as f32 / CAPTURE_SAMPLE_RATE as f32;
            (amplitude * (2.0 * std::f32::consts::PI * frequency * t).sin() * 32767.0) as i16
        })
        .collect()
}

/// Generate silence at the capture rate
#[must_use]
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn generate_silence(duration_secs: f32) -> Vec<i16> {
    vec![0; (CAPTURE_SAMPLE_RATE as f32 * duration_secs).round() as usize]
}
