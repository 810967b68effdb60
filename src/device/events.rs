//! Control-loop signalling
//!
//! Other tasks never touch device state. They set bits on the control loop's
//! event group or queue a [`Command`], and the loop handles both in a fixed
//! priority order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::{Notify, broadcast};

use super::state::{AecMode, DeviceState};
use crate::protocol::{AbortReason, ServerMessage};

/// Event bits, highest priority first
pub mod bits {
    pub const ERROR: u32 = 1 << 0;
    pub const SEND_AUDIO: u32 = 1 << 1;
    pub const WAKE_WORD: u32 = 1 << 2;
    pub const VOICE_ACTIVITY: u32 = 1 << 3;
    pub const SCHEDULE: u32 = 1 << 4;
    pub const PLAYBACK_IDLE: u32 = 1 << 5;
    pub const CLOCK_TICK: u32 = 1 << 6;
}

/// Work scheduled onto the control loop
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    ToggleChatState,
    StartListening,
    StopListening,
    WakeWordInvoke(String),
    AbortSpeaking(AbortReason),
    SendMcpMessage(Value),
    SetAecMode(AecMode),
    SetDeviceState(DeviceState),
    PlaySound(String),
    Alert {
        status: String,
        message: String,
        emotion: String,
        sound: Option<String>,
    },
    DismissAlert,
    Reboot,

    /// Inbound audio arrived while not yet speaking
    EnterSpeaking,

    /// A control message from the server
    Server(ServerMessage),

    ChannelOpened,
    ChannelClosed,

    /// Reconnect timer fired
    ReconnectTick,

    /// Leave the control loop
    Shutdown,
}

/// A device state transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub previous: DeviceState,
    pub current: DeviceState,
}

/// Everything other tasks share with the control loop
#[derive(Debug)]
pub struct ControlSignals {
    bits: Mutex<u32>,
    notify: Notify,
    commands: Mutex<VecDeque<Command>>,
    state: AtomicU8,
    voice_detected: AtomicBool,
    last_error: Mutex<Option<String>>,
    state_tx: broadcast::Sender<StateChange>,
}

impl Default for ControlSignals {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlSignals {
    #[must_use]
    pub fn new() -> Self {
        let (state_tx, _) = broadcast::channel(64);
        Self {
            bits: Mutex::new(0),
            notify: Notify::new(),
            commands: Mutex::new(VecDeque::new()),
            state: AtomicU8::new(DeviceState::Unknown.as_u8()),
            voice_detected: AtomicBool::new(false),
            last_error: Mutex::new(None),
            state_tx,
        }
    }

    /// Raise event bits and wake the control loop
    pub fn set(&self, mask: u32) {
        if let Ok(mut bits) = self.bits.lock() {
            *bits |= mask;
        }
        self.notify.notify_one();
    }

    /// Take all pending bits without waiting
    pub fn take(&self) -> u32 {
        self.bits.lock().map(|mut b| std::mem::take(&mut *b)).unwrap_or(0)
    }

    /// Wait until at least one bit is set, then take all of them
    pub async fn wait(&self) -> u32 {
        loop {
            let notified = self.notify.notified();
            let bits = self.take();
            if bits != 0 {
                return bits;
            }
            notified.await;
        }
    }

    /// Queue a command for the control loop
    pub fn schedule(&self, command: Command) {
        if let Ok(mut commands) = self.commands.lock() {
            commands.push_back(command);
        }
        self.set(bits::SCHEDULE);
    }

    pub(crate) fn drain_commands(&self) -> Vec<Command> {
        self.commands
            .lock()
            .map(|mut c| c.drain(..).collect())
            .unwrap_or_default()
    }

    /// Non-authoritative snapshot of the device state
    #[must_use]
    pub fn state(&self) -> DeviceState {
        DeviceState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn publish_state(&self, previous: DeviceState, current: DeviceState) {
        self.state.store(current.as_u8(), Ordering::Release);
        // No subscribers is fine; late listeners miss earlier transitions
        let _ = self.state_tx.send(StateChange { previous, current });
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.state_tx.subscribe()
    }

    /// Record a failure and raise the error bit
    pub fn raise_error(&self, message: impl Into<String>) {
        if let Ok(mut last) = self.last_error.lock() {
            *last = Some(message.into());
        }
        self.set(bits::ERROR);
    }

    pub(crate) fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|e| e.clone())
    }

    pub(crate) fn set_voice_detected(&self, detected: bool) {
        self.voice_detected.store(detected, Ordering::Release);
        self.set(bits::VOICE_ACTIVITY);
    }

    #[must_use]
    pub fn voice_detected(&self) -> bool {
        self.voice_detected.load(Ordering::Acquire)
    }
}
