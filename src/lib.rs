//! Beacon Device - conversational core of a voice assistant device
//!
//! This library provides:
//! - An audio pipeline (capture, codec and output units around bounded queues)
//! - The device state machine that drives a conversation turn
//! - A WebSocket protocol to the speech service
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                    Application                        │
//! │   control loop  │  state machine  │  reconnect policy │
//! └───────┬─────────────────────────────────────┬────────┘
//!         │                                     │
//! ┌───────▼──────────────────┐   ┌──────────────▼────────┐
//! │       AudioService        │   │       Protocol        │
//! │ capture │ codec │ output  │   │  WebSocket, framing   │
//! └───────┬──────────────────┘   └───────────────────────┘
//!         │
//! ┌───────▼──────────────────┐
//! │      AudioHardware        │
//! │   cpal input / output     │
//! └──────────────────────────┘
//! ```

pub mod audio;
pub mod config;
pub mod device;
pub mod error;
pub mod protocol;

pub use audio::{AudioEvent, AudioHardware, AudioService, AudioStreamPacket, PipelineState};
pub use config::Config;
pub use device::{AecMode, Application, DeviceHandle, DeviceState, ListeningMode};
pub use error::{Error, Result};
pub use protocol::{Protocol, ProtocolEvent, WebsocketProtocol};
