//! The control loop
//!
//! [`Application`] owns the device state. Every transition happens inside
//! [`Application::run_once`], which drains event bits in priority order:
//! error, outbound audio, wake word, voice activity, scheduled commands,
//! playback idle, clock tick.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::IntervalStream;

use super::dispatch;
use super::events::{Command, ControlSignals, bits};
use super::handle::DeviceHandle;
use super::peripherals::{DisplayMode, Peripherals};
use super::reconnect::{Reconnector, RetryOutcome};
use super::state::{AecMode, DeviceState, ListeningMode};
use crate::Result;
use crate::audio::sound::names;
use crate::audio::{AudioEvent, AudioService, SoundBank, sampled};
use crate::config::Config;
use crate::protocol::{AbortReason, Protocol, ProtocolEvent, ServerMessage, TtsState};

/// Statistics are logged every this many clock ticks
const STATS_EVERY_TICKS: u64 = 10;

/// Conversational controller for one device
pub struct Application {
    audio: Arc<AudioService>,
    protocol: Arc<dyn Protocol>,
    peripherals: Peripherals,
    sounds: SoundBank,
    signals: Arc<ControlSignals>,
    reconnect: Reconnector,

    stay_connected: bool,
    receive_custom_messages: bool,
    clock_interval: Duration,

    state: DeviceState,
    listening_mode: ListeningMode,
    aec_mode: AecMode,
    aborted: bool,
    waiting_for_playback: bool,
    clock_ticks: u64,
    discarded_uplink: u64,
    stopped: bool,

    receivers: Option<(
        mpsc::UnboundedReceiver<AudioEvent>,
        mpsc::UnboundedReceiver<ProtocolEvent>,
    )>,
    tasks: Vec<JoinHandle<()>>,
}

impl Application {
    /// Wire the controller to its collaborators
    ///
    /// `audio_events` and `protocol_events` must be the receiving ends of the
    /// channels given to `audio` and `protocol`.
    #[must_use]
    pub fn new(
        config: &Config,
        audio: Arc<AudioService>,
        protocol: Arc<dyn Protocol>,
        peripherals: Peripherals,
        sounds: SoundBank,
        audio_events: mpsc::UnboundedReceiver<AudioEvent>,
        protocol_events: mpsc::UnboundedReceiver<ProtocolEvent>,
    ) -> Self {
        Self {
            audio,
            protocol,
            peripherals,
            sounds,
            signals: Arc::new(ControlSignals::new()),
            reconnect: Reconnector::new(config.reconnect),
            stay_connected: config.device.stay_connected,
            receive_custom_messages: config.device.receive_custom_messages,
            clock_interval: config.device.clock_interval,
            state: DeviceState::Unknown,
            listening_mode: ListeningMode::default(),
            aec_mode: config.device.aec_mode,
            aborted: false,
            waiting_for_playback: false,
            clock_ticks: 0,
            discarded_uplink: 0,
            stopped: false,
            receivers: Some((audio_events, protocol_events)),
            tasks: Vec::new(),
        }
    }

    /// Handle for scheduling commands from other tasks
    #[must_use]
    pub fn handle(&self) -> DeviceHandle {
        DeviceHandle::new(
            Arc::clone(&self.signals),
            Arc::clone(&self.audio),
            Arc::clone(&self.protocol),
        )
    }

    #[must_use]
    pub const fn state(&self) -> DeviceState {
        self.state
    }

    #[must_use]
    pub const fn listening_mode(&self) -> ListeningMode {
        self.listening_mode
    }

    #[must_use]
    pub const fn aec_mode(&self) -> AecMode {
        self.aec_mode
    }

    /// Whether the current server stream was interrupted by the device
    #[must_use]
    pub const fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// Whether a playback-idle event is awaited to finish speaking
    #[must_use]
    pub const fn is_waiting_for_playback(&self) -> bool {
        self.waiting_for_playback
    }

    #[must_use]
    pub const fn reconnector(&self) -> &Reconnector {
        &self.reconnect
    }

    /// Bring the device to Idle
    ///
    /// Starts the protocol, applies the echo cancellation mode, and spawns the
    /// event dispatcher and the clock. The audio service is started by the
    /// caller.
    ///
    /// # Errors
    ///
    /// Returns error if the protocol cannot be started
    pub async fn start(&mut self) -> Result<()> {
        self.set_device_state(DeviceState::Starting).await;

        self.protocol.start().await?;
        self.apply_aec_mode();

        if let Some((audio_rx, protocol_rx)) = self.receivers.take() {
            self.tasks.push(tokio::spawn(dispatch::run(
                Arc::clone(&self.signals),
                Arc::clone(&self.audio),
                audio_rx,
                protocol_rx,
            )));
        }

        let signals = Arc::clone(&self.signals);
        let interval = self.clock_interval;
        self.tasks.push(tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticks = IntervalStream::new(tokio::time::interval_at(start, interval));
            while ticks.next().await.is_some() {
                signals.set(bits::CLOCK_TICK);
            }
        }));

        self.set_device_state(DeviceState::Idle).await;
        tracing::info!(
            aec = %self.aec_mode,
            stay_connected = self.stay_connected,
            "device started"
        );
        Ok(())
    }

    /// Process events until a shutdown command arrives
    pub async fn run(&mut self) {
        while !self.stopped {
            self.run_once().await;
        }
        tracing::info!("control loop stopped");
    }

    /// Wait for at least one event, then process everything pending
    pub async fn run_once(&mut self) {
        let pending = self.signals.wait().await;
        self.process(pending).await;
    }

    /// Process pending events without waiting, until none remain
    pub async fn run_pending(&mut self) {
        loop {
            let pending = self.signals.take();
            if pending == 0 {
                break;
            }
            self.process(pending).await;
        }
    }

    async fn process(&mut self, pending: u32) {
        if pending & bits::ERROR != 0 {
            self.handle_error_event().await;
        }
        if pending & bits::SEND_AUDIO != 0 {
            self.handle_send_audio().await;
        }
        if pending & bits::WAKE_WORD != 0 {
            self.handle_wake_word_detected().await;
        }
        if pending & bits::VOICE_ACTIVITY != 0 && self.state == DeviceState::Listening {
            self.peripherals.led.on_state_changed(self.state);
        }
        if pending & bits::SCHEDULE != 0 {
            for command in self.signals.drain_commands() {
                self.handle_command(command).await;
            }
        }
        if pending & bits::PLAYBACK_IDLE != 0 {
            self.handle_playback_idle().await;
        }
        if pending & bits::CLOCK_TICK != 0 {
            self.on_clock_tick();
        }
    }

    /// Transition and apply entry effects; a no-op when already in `state`
    pub async fn set_device_state(&mut self, state: DeviceState) {
        if self.state == state {
            return;
        }

        let previous = self.state;
        self.clock_ticks = 0;
        self.state = state;
        tracing::info!(%previous, new = %state, "state changed");
        self.signals.publish_state(previous, state);

        let display = Arc::clone(&self.peripherals.display);
        self.peripherals.led.on_state_changed(state);

        match state {
            DeviceState::Unknown | DeviceState::Idle => {
                display.set_status("standby");
                display.set_emotion("neutral");
                self.audio.enable_voice_processing(false);
                self.audio.enable_wake_word_detection(true);
            }
            DeviceState::Connecting => {
                display.set_status("connecting");
                display.set_emotion("thinking");
                display.set_chat_message("system", "");
            }
            DeviceState::Listening => {
                display.set_status("listening");
                display.set_emotion("neutral");

                // Re-sent on every entry so the server agrees on the mode
                if let Err(e) = self.protocol.send_start_listening(self.listening_mode).await {
                    tracing::warn!(error = %e, "failed to send start listening");
                }
                if !self.audio.is_audio_processor_running() {
                    self.audio.enable_voice_processing(true);
                    self.audio.enable_wake_word_detection(false);
                }
            }
            DeviceState::Speaking => {
                display.set_status("speaking");
                if self.listening_mode != ListeningMode::Realtime {
                    self.audio.enable_voice_processing(false);
                    self.audio
                        .enable_wake_word_detection(self.audio.wake_word_supports_concurrent());
                }
                self.audio.reset_decoder_state();
            }
            DeviceState::AudioTesting => display.set_status("audio testing"),
            DeviceState::WifiConfiguring => display.set_status("wifi configuring"),
            DeviceState::FatalError => display.set_status("error"),
            DeviceState::Starting
            | DeviceState::Upgrading
            | DeviceState::Activating => {}
        }
    }

    async fn set_listening_mode(&mut self, mode: ListeningMode) {
        self.listening_mode = mode;
        self.set_device_state(DeviceState::Listening).await;
    }

    /// Open the audio channel if needed, passing through Connecting
    ///
    /// A failure raises the error event once and leaves the state to it.
    async fn ensure_channel_open(&mut self) -> bool {
        if self.protocol.is_audio_channel_open() {
            return true;
        }
        self.set_device_state(DeviceState::Connecting).await;
        match self.protocol.open_audio_channel().await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "failed to open audio channel");
                self.signals.raise_error(e.to_string());
                false
            }
        }
    }

    /// Close the channel on purpose; no reconnect follows
    async fn close_audio_channel(&mut self) {
        self.protocol.close_audio_channel().await;
        self.peripherals.board.set_power_save_mode(true);
        self.peripherals.display.set_chat_message("system", "");
        self.set_device_state(DeviceState::Idle).await;
    }

    async fn handle_error_event(&mut self) {
        let message = self
            .signals
            .last_error()
            .unwrap_or_else(|| "unknown error".to_string());
        tracing::error!(error = %message, state = %self.state, "device error");
        self.set_device_state(DeviceState::Idle).await;
        self.alert("error", &message, "circle_xmark", Some(names::EXCLAMATION));
    }

    /// Drain the send queue into the protocol
    async fn handle_send_audio(&mut self) {
        while let Some(packet) = self.audio.pop_packet_from_send_queue() {
            if self.state == DeviceState::Speaking && self.listening_mode != ListeningMode::Realtime {
                self.discarded_uplink += 1;
                if sampled(self.discarded_uplink) {
                    tracing::debug!(discarded = self.discarded_uplink, "discarding uplink while speaking");
                }
                continue;
            }
            if !self.protocol.send_audio(packet).await {
                break;
            }
        }
    }

    async fn handle_wake_word_detected(&mut self) {
        let wake_word = self.audio.last_wake_word().unwrap_or_default();
        tracing::info!(wake_word = %wake_word, state = %self.state, "wake word detected");

        match self.state {
            DeviceState::Idle => {
                if !self.ensure_channel_open().await {
                    self.audio.enable_wake_word_detection(true);
                    return;
                }
                if let Err(e) = self.protocol.send_wake_word_detected(&wake_word).await {
                    tracing::warn!(error = %e, "failed to send wake word");
                }
                self.set_listening_mode(self.aec_mode.listening_mode()).await;
            }
            DeviceState::Speaking => {
                self.abort_speaking(AbortReason::WakeWordDetected).await;
                // Residue captured before the barge-in must not reach the server
                while self.audio.pop_packet_from_send_queue().is_some() {}
            }
            DeviceState::Activating => {
                self.set_device_state(DeviceState::Idle).await;
            }
            _ => {}
        }
    }

    async fn handle_playback_idle(&mut self) {
        if !self.waiting_for_playback || self.state != DeviceState::Speaking {
            return;
        }
        self.waiting_for_playback = false;
        self.finish_speaking().await;
    }

    async fn finish_speaking(&mut self) {
        if self.listening_mode == ListeningMode::ManualStop && !self.stay_connected {
            self.set_device_state(DeviceState::Idle).await;
        } else {
            self.set_device_state(DeviceState::Listening).await;
        }
    }

    fn on_clock_tick(&mut self) {
        self.clock_ticks += 1;
        self.peripherals.display.update_status_bar(false);

        if self.clock_ticks % STATS_EVERY_TICKS == 0 {
            let stats = self.audio.stats();
            tracing::debug!(
                state = %self.state,
                pipeline = %stats.state,
                decode_queue = stats.decode_queue,
                playback_queue = stats.playback_queue,
                send_queue = stats.send_queue,
                decoded = stats.decoded,
                played = stats.played,
                decode_dropped = stats.decode_dropped,
                send_dropped = stats.send_dropped,
                "pipeline statistics"
            );
        }
    }

    async fn handle_command(&mut self, command: Command) {
        tracing::trace!(?command, state = %self.state, "command");
        match command {
            Command::ToggleChatState => self.toggle_chat_state().await,
            Command::StartListening => self.start_listening().await,
            Command::StopListening => self.stop_listening().await,
            Command::WakeWordInvoke(wake_word) => self.wake_word_invoke(&wake_word).await,
            Command::AbortSpeaking(reason) => self.abort_speaking(reason).await,
            Command::SendMcpMessage(payload) => {
                if let Err(e) = self.protocol.send_mcp_message(payload).await {
                    tracing::warn!(error = %e, "failed to send mcp message");
                }
            }
            Command::SetAecMode(mode) => self.set_aec_mode(mode).await,
            Command::SetDeviceState(state) => self.set_device_state(state).await,
            Command::PlaySound(name) => self.play_sound(&name),
            Command::Alert {
                status,
                message,
                emotion,
                sound,
            } => self.alert(&status, &message, &emotion, sound.as_deref()),
            Command::DismissAlert => self.dismiss_alert(),
            Command::Reboot => {
                tracing::warn!("rebooting");
                self.audio.stop();
                self.peripherals.board.reboot();
            }
            Command::EnterSpeaking => {
                if matches!(self.state, DeviceState::Idle | DeviceState::Listening) {
                    self.set_device_state(DeviceState::Speaking).await;
                }
            }
            Command::Server(message) => self.handle_server_message(message).await,
            Command::ChannelOpened => self.on_channel_opened(),
            Command::ChannelClosed => self.on_channel_closed().await,
            Command::ReconnectTick => self.reconnect_tick().await,
            Command::Shutdown => {
                self.reconnect.stop();
                self.stopped = true;
            }
        }
    }

    async fn toggle_chat_state(&mut self) {
        match self.state {
            DeviceState::Activating => self.set_device_state(DeviceState::Idle).await,
            DeviceState::WifiConfiguring => {
                self.audio.enable_audio_testing(true);
                self.set_device_state(DeviceState::AudioTesting).await;
            }
            DeviceState::AudioTesting => {
                self.audio.enable_audio_testing(false);
                self.set_device_state(DeviceState::WifiConfiguring).await;
            }
            DeviceState::Idle => {
                if self.ensure_channel_open().await {
                    self.set_listening_mode(self.aec_mode.listening_mode()).await;
                }
            }
            DeviceState::Speaking => self.abort_speaking(AbortReason::None).await,
            DeviceState::Listening => {
                if let Err(e) = self.protocol.send_stop_listening().await {
                    tracing::warn!(error = %e, "failed to send stop listening");
                }
                if !self.stay_connected {
                    self.set_device_state(DeviceState::Idle).await;
                }
            }
            _ => tracing::debug!(state = %self.state, "toggle ignored"),
        }
    }

    async fn start_listening(&mut self) {
        match self.state {
            DeviceState::Activating => self.set_device_state(DeviceState::Idle).await,
            DeviceState::WifiConfiguring => {
                self.audio.enable_audio_testing(true);
                self.set_device_state(DeviceState::AudioTesting).await;
            }
            DeviceState::Idle => {
                if self.ensure_channel_open().await {
                    self.set_listening_mode(ListeningMode::ManualStop).await;
                }
            }
            DeviceState::Speaking => {
                self.abort_speaking(AbortReason::None).await;
                self.set_listening_mode(ListeningMode::ManualStop).await;
            }
            _ => {}
        }
    }

    async fn stop_listening(&mut self) {
        match self.state {
            DeviceState::AudioTesting => {
                self.audio.enable_audio_testing(false);
                self.set_device_state(DeviceState::WifiConfiguring).await;
            }
            DeviceState::Listening => {
                if let Err(e) = self.protocol.send_stop_listening().await {
                    tracing::warn!(error = %e, "failed to send stop listening");
                }
                if !self.stay_connected {
                    self.set_device_state(DeviceState::Idle).await;
                }
            }
            _ => {}
        }
    }

    async fn wake_word_invoke(&mut self, wake_word: &str) {
        match self.state {
            DeviceState::Idle => {
                self.toggle_chat_state().await;
                if self.protocol.is_audio_channel_open() {
                    if let Err(e) = self.protocol.send_wake_word_detected(wake_word).await {
                        tracing::warn!(error = %e, "failed to send wake word");
                    }
                }
            }
            DeviceState::Speaking => self.abort_speaking(AbortReason::None).await,
            DeviceState::Listening => self.close_audio_channel().await,
            _ => {}
        }
    }

    async fn abort_speaking(&mut self, reason: AbortReason) {
        tracing::info!(?reason, "abort speaking");
        self.aborted = true;
        if let Err(e) = self.protocol.send_abort_speaking(reason).await {
            tracing::warn!(error = %e, "failed to send abort");
        }

        // The stream already ended and only the tail is playing
        if self.waiting_for_playback && self.state == DeviceState::Speaking {
            self.audio.reset_decoder();
            self.waiting_for_playback = false;
            self.finish_speaking().await;
        }
    }

    /// Push the echo cancellation mode to the pipeline and the protocol
    fn apply_aec_mode(&self) {
        let mode = self.aec_mode;
        self.audio.enable_device_aec(mode == AecMode::OnDeviceSide);
        self.audio.set_server_aec(mode == AecMode::OnServerSide);
        self.protocol.set_server_aec(mode == AecMode::OnServerSide);
    }

    async fn set_aec_mode(&mut self, mode: AecMode) {
        self.aec_mode = mode;
        self.apply_aec_mode();
        tracing::info!(aec = %mode, "echo cancellation mode changed");

        let sound = if mode == AecMode::Off {
            names::AEC_OFF
        } else {
            names::AEC_ON
        };
        self.play_sound(sound);

        // The hello announces the mode, so a live session must be renegotiated
        if self.protocol.is_audio_channel_open() {
            self.close_audio_channel().await;
        }
    }

    fn play_sound(&self, name: &str) {
        let Some(clip) = self.sounds.get(name) else {
            tracing::debug!(name, "sound not available");
            return;
        };
        let clip = clip.clone();
        let audio = Arc::clone(&self.audio);
        // Pushing may wait on a full decode queue
        tokio::task::spawn_blocking(move || audio.play_sound(&clip));
    }

    fn alert(&self, status: &str, message: &str, emotion: &str, sound: Option<&str>) {
        tracing::warn!(status, message, emotion, "alert");
        let display = &self.peripherals.display;
        display.set_status(status);
        display.set_emotion(emotion);
        display.set_chat_message("system", message);
        if let Some(sound) = sound {
            self.play_sound(sound);
        }
    }

    fn dismiss_alert(&self) {
        if self.state != DeviceState::Idle {
            return;
        }
        let display = &self.peripherals.display;
        display.set_status("standby");
        display.set_emotion("neutral");
        display.set_chat_message("system", "");
        display.set_display_mode(DisplayMode::Emotion);
    }

    fn on_channel_opened(&mut self) {
        self.peripherals.board.set_power_save_mode(false);
        self.reconnect.stop();
        let server_rate = self.protocol.server_sample_rate();
        let output_rate = self.audio.hardware().output_sample_rate();
        if server_rate != output_rate {
            tracing::warn!(
                server_rate,
                output_rate,
                "server sample rate differs from output; audio will be resampled"
            );
        }
    }

    async fn on_channel_closed(&mut self) {
        tracing::info!(state = %self.state, "audio channel closed");
        self.peripherals.board.set_power_save_mode(true);
        self.peripherals.display.set_chat_message("system", "");
        self.set_device_state(DeviceState::Idle).await;
        if self.stay_connected {
            self.reconnect.start(&self.signals);
        }
    }

    async fn reconnect_tick(&mut self) {
        if !self.reconnect.is_active() {
            return;
        }
        if self.protocol.is_audio_channel_open() {
            self.reconnect.stop();
            return;
        }
        if self.state != DeviceState::Idle {
            tracing::debug!(state = %self.state, "reconnect skipped");
            return;
        }

        if self.reconnect.should_reset_network() {
            let ok = self.peripherals.board.reset_network();
            tracing::warn!(failures = self.reconnect.failures(), ok, "resetting network before reconnect");
        }

        match self.protocol.open_audio_channel().await {
            Ok(()) => {
                tracing::info!(failures = self.reconnect.failures(), "reconnected");
                self.reconnect.stop();
                self.set_listening_mode(self.aec_mode.listening_mode()).await;
            }
            Err(e) => {
                tracing::warn!(error = %e, failures = self.reconnect.failures() + 1, "reconnect failed");
                if self.reconnect.record_failure(&self.signals) == RetryOutcome::GiveUp {
                    self.alert("error", "unable to reconnect", "sad", Some(names::EXCLAMATION));
                }
            }
        }
    }

    async fn handle_server_message(&mut self, message: ServerMessage) {
        let display = Arc::clone(&self.peripherals.display);
        match message {
            ServerMessage::Tts { state, text, emotion } => match state {
                TtsState::Start => {
                    self.aborted = false;
                    if matches!(self.state, DeviceState::Idle | DeviceState::Listening) {
                        self.set_device_state(DeviceState::Speaking).await;
                    }
                }
                TtsState::Stop => {
                    if self.state == DeviceState::Speaking {
                        if self.aborted {
                            // Interrupted: drop the rest of the answer instead of playing it out
                            self.audio.reset_decoder();
                            self.waiting_for_playback = false;
                            self.finish_speaking().await;
                        } else if self.audio.request_playback_idle_notification() {
                            self.finish_speaking().await;
                        } else {
                            self.waiting_for_playback = true;
                        }
                    }
                }
                TtsState::SentenceStart => {
                    if let Some(text) = text {
                        display.set_chat_message("assistant", &text);
                    }
                    if let Some(emotion) = emotion {
                        display.set_emotion(&emotion);
                    }
                }
                TtsState::Other => {}
            },
            ServerMessage::Stt { text } => display.set_chat_message("user", &text),
            ServerMessage::Llm { text, emotion, .. } => {
                if let Some(emotion) = emotion {
                    display.set_emotion(&emotion);
                }
                if let Some(text) = text {
                    display.set_chat_message("assistant", &text);
                }
            }
            ServerMessage::Mcp { payload } => self.peripherals.mcp.handle(&payload),
            ServerMessage::System { command } => {
                if command == "reboot" {
                    self.signals.schedule(Command::Reboot);
                } else {
                    tracing::warn!(command, "unknown system command");
                }
            }
            ServerMessage::Alert {
                status,
                message,
                emotion,
            } => self.alert(&status, &message, &emotion, Some(names::VIBRATION)),
            ServerMessage::Custom { payload } => {
                if self.receive_custom_messages {
                    display.set_chat_message("system", &custom_text(&payload));
                }
            }
            ServerMessage::Error { message } => {
                tracing::warn!(message, "server reported an error");
                if matches!(self.state, DeviceState::Listening | DeviceState::Speaking)
                    && self.protocol.is_audio_channel_open()
                {
                    if let Err(e) = self.protocol.send_start_listening(self.listening_mode).await {
                        tracing::warn!(error = %e, "failed to resume listening");
                    }
                }
            }
            ServerMessage::Hello(_) | ServerMessage::Unknown => {}
        }
    }
}

impl Drop for Application {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

fn custom_text(payload: &Value) -> String {
    payload
        .as_str()
        .map_or_else(|| payload.to_string(), str::to_string)
}
