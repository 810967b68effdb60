//! Cloneable front door to a running [`Application`](super::Application)

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast;

use super::events::{Command, ControlSignals, StateChange};
use super::state::{AecMode, DeviceState};
use crate::audio::AudioService;
use crate::protocol::{AbortReason, Protocol};

/// Schedules work onto the control loop from any task or thread
#[derive(Clone)]
pub struct DeviceHandle {
    signals: Arc<ControlSignals>,
    audio: Arc<AudioService>,
    protocol: Arc<dyn Protocol>,
}

impl DeviceHandle {
    pub(crate) fn new(
        signals: Arc<ControlSignals>,
        audio: Arc<AudioService>,
        protocol: Arc<dyn Protocol>,
    ) -> Self {
        Self {
            signals,
            audio,
            protocol,
        }
    }

    /// Last published state; may lag the control loop
    #[must_use]
    pub fn state(&self) -> DeviceState {
        self.signals.state()
    }

    /// Receive every subsequent state transition
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.signals.subscribe()
    }

    /// Whether the voice processor currently hears speech
    #[must_use]
    pub fn is_voice_detected(&self) -> bool {
        self.signals.voice_detected()
    }

    /// Queue an arbitrary command
    pub fn schedule(&self, command: Command) {
        self.signals.schedule(command);
    }

    /// The button press: start, interrupt or end a conversation
    pub fn toggle_chat_state(&self) {
        self.schedule(Command::ToggleChatState);
    }

    /// Push-to-talk pressed
    pub fn start_listening(&self) {
        self.schedule(Command::StartListening);
    }

    /// Push-to-talk released
    pub fn stop_listening(&self) {
        self.schedule(Command::StopListening);
    }

    /// Start a conversation as if `wake_word` had been heard
    pub fn wake_word_invoke(&self, wake_word: impl Into<String>) {
        self.schedule(Command::WakeWordInvoke(wake_word.into()));
    }

    pub fn abort_speaking(&self, reason: AbortReason) {
        self.schedule(Command::AbortSpeaking(reason));
    }

    pub fn send_mcp_message(&self, payload: Value) {
        self.schedule(Command::SendMcpMessage(payload));
    }

    pub fn set_aec_mode(&self, mode: AecMode) {
        self.schedule(Command::SetAecMode(mode));
    }

    pub fn set_device_state(&self, state: DeviceState) {
        self.schedule(Command::SetDeviceState(state));
    }

    pub fn play_sound(&self, name: impl Into<String>) {
        self.schedule(Command::PlaySound(name.into()));
    }

    pub fn alert(
        &self,
        status: impl Into<String>,
        message: impl Into<String>,
        emotion: impl Into<String>,
        sound: Option<String>,
    ) {
        self.schedule(Command::Alert {
            status: status.into(),
            message: message.into(),
            emotion: emotion.into(),
            sound,
        });
    }

    pub fn dismiss_alert(&self) {
        self.schedule(Command::DismissAlert);
    }

    pub fn reboot(&self) {
        self.schedule(Command::Reboot);
    }

    /// Ask the control loop to return from [`Application::run`](super::Application::run)
    pub fn shutdown(&self) {
        self.schedule(Command::Shutdown);
    }

    /// Idle, disconnected and with a silent pipeline
    #[must_use]
    pub fn can_enter_sleep_mode(&self) -> bool {
        self.state() == DeviceState::Idle
            && !self.protocol.is_audio_channel_open()
            && self.audio.is_idle()
    }
}
