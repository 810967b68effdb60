//! TOML configuration file loading
//!
//! Supports `~/.config/omni/beacon-device/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct DeviceConfigFile {
    /// Audio pipeline configuration
    #[serde(default)]
    pub audio: AudioFileConfig,

    /// Device state machine configuration
    #[serde(default)]
    pub device: DeviceFileConfig,

    /// WebSocket protocol configuration
    #[serde(default)]
    pub websocket: WebsocketFileConfig,

    /// Reconnect policy configuration
    #[serde(default)]
    pub reconnect: ReconnectFileConfig,

    /// Sound asset configuration
    #[serde(default)]
    pub sounds: SoundsFileConfig,
}

/// Audio pipeline configuration
#[derive(Debug, Default, Deserialize)]
pub struct AudioFileConfig {
    /// Network codec ("pcm16" or "opus")
    pub codec: Option<String>,

    /// Frame duration in milliseconds
    pub frame_duration_ms: Option<u32>,

    /// Raw frames awaiting compression
    pub encode_queue_depth: Option<usize>,

    /// Inbound packets awaiting decompression (jitter buffer)
    pub decode_queue_depth: Option<usize>,

    /// Compressed packets awaiting transmission
    pub send_queue_depth: Option<usize>,

    /// Decoded frames awaiting speaker output
    pub playback_queue_depth: Option<usize>,

    /// Frames needed before playback starts
    pub buffer_start_frames: Option<usize>,

    /// Frames needed before playback resumes after an underrun
    pub buffer_resume_frames: Option<usize>,

    /// Bounded wait for locally sourced decode pushes
    pub decode_wait_timeout_ms: Option<u64>,

    /// Delay after a capture mode switch
    pub input_warmup_ms: Option<u64>,

    /// Idle time before input/output paths are powered down
    pub power_timeout_ms: Option<u64>,

    /// Loopback test recording limit
    pub test_max_duration_ms: Option<u64>,

    /// Speaker volume (0-100)
    pub output_volume: Option<u8>,

    /// Wake phrases reported by the energy wake word backend
    pub wake_words: Option<Vec<String>>,
}

/// Device state machine configuration
#[derive(Debug, Default, Deserialize)]
pub struct DeviceFileConfig {
    /// Echo cancellation mode ("off", "device", "server")
    pub aec: Option<String>,

    /// Keep the audio channel open and stay in listening between turns
    pub stay_connected: Option<bool>,

    /// Forward `custom` server messages to the display
    pub receive_custom_messages: Option<bool>,

    /// Bookkeeping tick interval
    pub clock_interval_ms: Option<u64>,
}

/// WebSocket protocol configuration
#[derive(Debug, Default, Deserialize)]
pub struct WebsocketFileConfig {
    pub url: Option<String>,
    pub token: Option<String>,
    pub version: Option<u8>,
    pub device_id: Option<String>,
    pub client_id: Option<String>,
    pub hello_timeout_ms: Option<u64>,
    pub heartbeat_interval_ms: Option<u64>,
    pub channel_timeout_ms: Option<u64>,
}

/// Reconnect policy configuration
#[derive(Debug, Default, Deserialize)]
pub struct ReconnectFileConfig {
    /// "fixed", "backoff" or "disabled"
    pub policy: Option<String>,

    /// Fixed policy: retry interval
    pub interval_ms: Option<u64>,

    /// Fixed policy: consecutive failures between network resets
    pub network_reset_threshold: Option<u32>,

    /// Backoff policy: first delay
    pub initial_ms: Option<u64>,

    /// Backoff policy: delay cap
    pub max_ms: Option<u64>,

    /// Backoff policy: attempts before giving up
    pub max_attempts: Option<u32>,
}

/// Sound asset configuration
#[derive(Debug, Default, Deserialize)]
pub struct SoundsFileConfig {
    /// Directory holding sound clips
    pub dir: Option<String>,
}

/// Load the TOML config file from the standard path
///
/// Returns `DeviceConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> DeviceConfigFile {
    config_file_path().map_or_else(DeviceConfigFile::default, |path| load_config_from(&path))
}

/// Load a TOML config file from an explicit path
///
/// Missing or malformed files fall back to defaults with a warning.
pub fn load_config_from(path: &Path) -> DeviceConfigFile {
    if !path.exists() {
        return DeviceConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                DeviceConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            DeviceConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/omni/beacon-device/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| {
        d.config_dir()
            .join("omni")
            .join("beacon-device")
            .join("config.toml")
    })
}
