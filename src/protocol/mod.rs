//! Speech service protocol
//!
//! The control loop talks to the server only through [`Protocol`]; the
//! transport reports back through [`ProtocolEvent`]s on a channel handed to it
//! at construction.

pub mod frame;
mod message;
mod websocket;

use async_trait::async_trait;
use serde_json::Value;

pub use message::{
    AbortReason, ClientHello, ClientMessage, ListenState, ServerAudioParams, ServerHello,
    ServerMessage, TtsState,
};
pub use websocket::WebsocketProtocol;

use crate::Result;
use crate::audio::AudioStreamPacket;
use crate::device::ListeningMode;

/// Default downlink rate until the server hello says otherwise
pub const DEFAULT_SERVER_SAMPLE_RATE: u32 = 24_000;

/// Default downlink frame duration
pub const DEFAULT_SERVER_FRAME_DURATION: u32 = 60;

/// Notifications from the transport
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    /// A codec packet for playback
    IncomingAudio(AudioStreamPacket),

    /// A parsed control message
    IncomingJson(ServerMessage),

    /// The transport failed; the payload is user-presentable
    NetworkError(String),

    AudioChannelOpened,

    /// The server or network closed the channel
    AudioChannelClosed,
}

/// Persistent channel to the speech service
#[async_trait]
pub trait Protocol: Send + Sync {
    /// Prepare the transport (no connection is made yet)
    ///
    /// # Errors
    ///
    /// Returns error if the transport cannot be prepared
    async fn start(&self) -> Result<()>;

    /// Connect and complete the hello handshake
    ///
    /// # Errors
    ///
    /// Returns error if the connection or handshake fails
    async fn open_audio_channel(&self) -> Result<()>;

    /// Disconnect without reporting `AudioChannelClosed`
    async fn close_audio_channel(&self);

    fn is_audio_channel_open(&self) -> bool;

    /// Send one encoded packet; returns whether it was handed to the transport
    async fn send_audio(&self, packet: AudioStreamPacket) -> bool;

    /// Send a text frame
    ///
    /// # Errors
    ///
    /// Returns error if the channel is closed or the send fails
    async fn send_text(&self, text: String) -> Result<()>;

    /// Session assigned by the server hello
    fn session_id(&self) -> String;

    fn server_sample_rate(&self) -> u32;

    fn server_frame_duration(&self) -> u32;

    /// Announce server-side echo cancellation in the next hello
    fn set_server_aec(&self, _enable: bool) {}

    /// # Errors
    ///
    /// Returns error if the message cannot be sent
    async fn send_start_listening(&self, mode: ListeningMode) -> Result<()> {
        let text = ClientMessage::start_listening(&self.session_id(), mode).to_json()?;
        self.send_text(text).await
    }

    /// # Errors
    ///
    /// Returns error if the message cannot be sent
    async fn send_stop_listening(&self) -> Result<()> {
        let text = ClientMessage::stop_listening(&self.session_id()).to_json()?;
        self.send_text(text).await
    }

    /// # Errors
    ///
    /// Returns error if the message cannot be sent
    async fn send_abort_speaking(&self, reason: AbortReason) -> Result<()> {
        let text = ClientMessage::abort_speaking(&self.session_id(), reason).to_json()?;
        self.send_text(text).await
    }

    /// # Errors
    ///
    /// Returns error if the message cannot be sent
    async fn send_wake_word_detected(&self, wake_word: &str) -> Result<()> {
        let text = ClientMessage::wake_word_detected(&self.session_id(), wake_word).to_json()?;
        self.send_text(text).await
    }

    /// # Errors
    ///
    /// Returns error if the message cannot be sent
    async fn send_mcp_message(&self, payload: Value) -> Result<()> {
        let text = ClientMessage::mcp(&self.session_id(), payload).to_json()?;
        self.send_text(text).await
    }
}
