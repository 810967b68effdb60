//! Routes pipeline and transport events onto the control loop
//!
//! Inbound audio goes straight to the decode queue without waiting, and tts
//! start/stop toggle prebuffering here so the jitter buffer reacts before the
//! control loop gets to the message.

use std::sync::Arc;

use tokio::sync::mpsc;

use super::events::{Command, ControlSignals, bits};
use super::state::DeviceState;
use crate::audio::{AudioEvent, AudioService};
use crate::protocol::{ProtocolEvent, ServerMessage, TtsState};

pub(crate) async fn run(
    signals: Arc<ControlSignals>,
    audio: Arc<AudioService>,
    mut audio_rx: mpsc::UnboundedReceiver<AudioEvent>,
    mut protocol_rx: mpsc::UnboundedReceiver<ProtocolEvent>,
) {
    let mut audio_open = true;
    let mut protocol_open = true;

    while audio_open || protocol_open {
        tokio::select! {
            event = audio_rx.recv(), if audio_open => match event {
                Some(event) => on_audio_event(&signals, event),
                None => audio_open = false,
            },
            event = protocol_rx.recv(), if protocol_open => match event {
                Some(event) => on_protocol_event(&signals, &audio, event),
                None => protocol_open = false,
            },
        }
    }
    tracing::debug!("event dispatcher stopped");
}

fn on_audio_event(signals: &ControlSignals, event: AudioEvent) {
    match event {
        AudioEvent::SendQueueAvailable => signals.set(bits::SEND_AUDIO),
        // The control loop reads the phrase back from the pipeline
        AudioEvent::WakeWordDetected(_) => signals.set(bits::WAKE_WORD),
        AudioEvent::VoiceActivity(speaking) => signals.set_voice_detected(speaking),
        AudioEvent::PlaybackIdle => signals.set(bits::PLAYBACK_IDLE),
    }
}

fn on_protocol_event(signals: &ControlSignals, audio: &AudioService, event: ProtocolEvent) {
    match event {
        ProtocolEvent::IncomingAudio(packet) => {
            let state = signals.state();
            if matches!(
                state,
                DeviceState::Speaking | DeviceState::Idle | DeviceState::Listening
            ) {
                if state != DeviceState::Speaking {
                    signals.schedule(Command::EnterSpeaking);
                }
                audio.push_packet_to_decode_queue(packet, false);
            }
        }
        ProtocolEvent::IncomingJson(message) => {
            if let ServerMessage::Tts { state, .. } = &message {
                match state {
                    TtsState::Start => audio.start_prebuffering(),
                    TtsState::Stop => audio.stop_prebuffering(),
                    TtsState::SentenceStart | TtsState::Other => {}
                }
            }
            tracing::debug!(kind = message.kind(), "server message");
            signals.schedule(Command::Server(message));
        }
        ProtocolEvent::NetworkError(message) => signals.raise_error(message),
        ProtocolEvent::AudioChannelOpened => signals.schedule(Command::ChannelOpened),
        ProtocolEvent::AudioChannelClosed => signals.schedule(Command::ChannelClosed),
    }
}
