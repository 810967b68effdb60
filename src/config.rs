//! Configuration management for Beacon device

pub mod file;

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::audio::CodecKind;
use crate::device::AecMode;
use crate::{Error, Result};

use file::DeviceConfigFile;

/// Beacon device configuration
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Audio pipeline configuration
    pub audio: AudioConfig,

    /// Device state machine configuration
    pub device: DeviceConfig,

    /// WebSocket protocol configuration
    pub websocket: WebsocketConfig,

    /// Audio channel reconnect policy
    pub reconnect: ReconnectPolicy,

    /// Sound asset configuration
    pub sounds: SoundConfig,
}

/// Audio pipeline configuration
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// Network codec used for uplink and downlink audio
    pub codec: CodecKind,

    /// Duration of one frame in milliseconds
    pub frame_duration_ms: u32,

    /// Encode queue capacity (raw frames awaiting compression)
    pub encode_queue_depth: usize,

    /// Decode queue capacity (inbound packets, the jitter buffer)
    pub decode_queue_depth: usize,

    /// Send queue capacity (compressed packets awaiting transmission)
    pub send_queue_depth: usize,

    /// Playback queue capacity (decoded frames awaiting the speaker)
    pub playback_queue_depth: usize,

    /// Frames accumulated before Buffering turns into Playing
    pub buffer_start_frames: usize,

    /// Frames accumulated before Rebuffering turns into Playing
    pub buffer_resume_frames: usize,

    /// Bounded wait used for locally sourced decode pushes
    pub decode_wait_timeout: Duration,

    /// Delay inserted after any capture mode transition
    pub input_warmup: Duration,

    /// Idle time after which input/output paths are powered down
    pub power_timeout: Duration,

    /// Interval of the power watchdog
    pub power_check_interval: Duration,

    /// Maximum duration recorded by the loopback test
    pub test_max_duration: Duration,

    /// Playback timestamps kept for echo correlation
    pub max_timestamps: usize,

    /// Speaker volume (0-100)
    pub output_volume: u8,

    /// Wake phrases reported by the energy wake word backend
    pub wake_words: Vec<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            codec: CodecKind::Pcm16,
            frame_duration_ms: 60,
            encode_queue_depth: 2,
            decode_queue_depth: 200,
            send_queue_depth: 2400 / 60,
            playback_queue_depth: 10,
            buffer_start_frames: 10,
            buffer_resume_frames: 5,
            decode_wait_timeout: Duration::from_millis(100),
            input_warmup: Duration::from_millis(120),
            power_timeout: Duration::from_secs(15),
            power_check_interval: Duration::from_secs(1),
            test_max_duration: Duration::from_secs(10),
            max_timestamps: 3,
            output_volume: 70,
            wake_words: vec!["hey beacon".to_string()],
        }
    }
}

impl AudioConfig {
    /// Loopback test queue capacity derived from the maximum test duration
    #[must_use]
    pub fn test_queue_depth(&self) -> usize {
        let frame_ms = u64::from(self.frame_duration_ms.max(1));
        let frames = u64::try_from(self.test_max_duration.as_millis()).unwrap_or(u64::MAX) / frame_ms;
        usize::try_from(frames).unwrap_or(usize::MAX).max(1)
    }

    /// Samples in one 16 kHz mono frame
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn frame_samples(&self) -> usize {
        (16_000 / 1000 * self.frame_duration_ms) as usize
    }
}

/// Device state machine configuration
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Echo cancellation mode
    pub aec_mode: AecMode,

    /// Keep the channel open and remain listening between turns
    pub stay_connected: bool,

    /// Forward `custom` server messages to the display
    pub receive_custom_messages: bool,

    /// Bookkeeping tick interval
    pub clock_interval: Duration,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            aec_mode: AecMode::Off,
            stay_connected: false,
            receive_custom_messages: false,
            clock_interval: Duration::from_secs(1),
        }
    }
}

/// WebSocket protocol configuration
#[derive(Debug, Clone)]
pub struct WebsocketConfig {
    /// Speech service endpoint
    pub url: String,

    /// Access token sent in the `Authorization` header
    pub token: Option<String>,

    /// Binary framing version (1, 2 or 3)
    pub version: u8,

    /// Stable device identifier
    pub device_id: String,

    /// Per-install client identifier
    pub client_id: String,

    /// How long to wait for the server hello
    pub hello_timeout: Duration,

    /// Ping interval while no audio stream is in progress
    pub heartbeat_interval: Duration,

    /// Inbound silence after which the channel is considered closed
    pub channel_timeout: Duration,
}

impl Default for WebsocketConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8000/device/v1/".to_string(),
            token: None,
            version: 1,
            device_id: "beacon-device".to_string(),
            client_id: uuid::Uuid::new_v4().to_string(),
            hello_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            channel_timeout: Duration::from_secs(120),
        }
    }
}

/// How the device recovers a closed audio channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPolicy {
    /// Never reconnect on its own
    Disabled,

    /// Retry forever at a fixed interval, resetting the network every N failures
    FixedInterval {
        interval: Duration,
        network_reset_threshold: u32,
    },

    /// Exponential backoff with a retry cap
    Backoff {
        initial: Duration,
        max: Duration,
        max_attempts: u32,
    },
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::FixedInterval {
            interval: Duration::from_secs(5),
            network_reset_threshold: 3,
        }
    }
}

/// Sound asset configuration
#[derive(Debug, Clone, Default)]
pub struct SoundConfig {
    /// Directory holding sound clips (`popup.p3`, `exclamation.p3`, ...)
    pub dir: Option<PathBuf>,
}

impl Config {
    /// Load configuration from the standard config file and environment
    ///
    /// # Errors
    ///
    /// Returns error if the resulting configuration is invalid
    pub fn load() -> Result<Self> {
        Self::load_with_options(None)
    }

    /// Load configuration with an explicit config file path
    ///
    /// # Errors
    ///
    /// Returns error if the resulting configuration is invalid
    pub fn load_with_options(config_path: Option<&Path>) -> Result<Self> {
        // Load optional TOML config file (env > toml > default)
        let fc = config_path.map_or_else(file::load_config_file, file::load_config_from);
        let config = Self::from_file(fc)?;
        config.validate()?;
        Ok(config)
    }

    /// Build a configuration from a parsed config file plus environment overrides
    ///
    /// # Errors
    ///
    /// Returns error if an enumerated value cannot be parsed
    pub fn from_file(fc: DeviceConfigFile) -> Result<Self> {
        let defaults = Self::default();

        // Audio pipeline (env > toml > default)
        let codec = match env_string("BEACON_DEVICE_CODEC").or(fc.audio.codec) {
            Some(s) => CodecKind::from_str(&s)?,
            None => defaults.audio.codec,
        };
        let d = defaults.audio;
        let audio = AudioConfig {
            codec,
            frame_duration_ms: fc.audio.frame_duration_ms.unwrap_or(d.frame_duration_ms),
            encode_queue_depth: fc.audio.encode_queue_depth.unwrap_or(d.encode_queue_depth),
            decode_queue_depth: fc.audio.decode_queue_depth.unwrap_or(d.decode_queue_depth),
            send_queue_depth: fc.audio.send_queue_depth.unwrap_or(d.send_queue_depth),
            playback_queue_depth: fc
                .audio
                .playback_queue_depth
                .unwrap_or(d.playback_queue_depth),
            buffer_start_frames: fc.audio.buffer_start_frames.unwrap_or(d.buffer_start_frames),
            buffer_resume_frames: fc
                .audio
                .buffer_resume_frames
                .unwrap_or(d.buffer_resume_frames),
            decode_wait_timeout: fc
                .audio
                .decode_wait_timeout_ms
                .map_or(d.decode_wait_timeout, Duration::from_millis),
            input_warmup: fc
                .audio
                .input_warmup_ms
                .map_or(d.input_warmup, Duration::from_millis),
            power_timeout: fc
                .audio
                .power_timeout_ms
                .map_or(d.power_timeout, Duration::from_millis),
            power_check_interval: d.power_check_interval,
            test_max_duration: fc
                .audio
                .test_max_duration_ms
                .map_or(d.test_max_duration, Duration::from_millis),
            max_timestamps: d.max_timestamps,
            output_volume: env_parse("BEACON_DEVICE_VOLUME")
                .or(fc.audio.output_volume)
                .unwrap_or(d.output_volume)
                .min(100),
            wake_words: fc.audio.wake_words.unwrap_or(d.wake_words),
        };

        // Device behaviour (env > toml > default)
        let aec_mode = env_string("BEACON_DEVICE_AEC")
            .or(fc.device.aec)
            .map_or(defaults.device.aec_mode, |s| AecMode::from_str(&s));
        let device = DeviceConfig {
            aec_mode,
            stay_connected: env_bool("BEACON_DEVICE_STAY_CONNECTED")
                .or(fc.device.stay_connected)
                .unwrap_or(defaults.device.stay_connected),
            receive_custom_messages: fc
                .device
                .receive_custom_messages
                .unwrap_or(defaults.device.receive_custom_messages),
            clock_interval: fc
                .device
                .clock_interval_ms
                .map_or(defaults.device.clock_interval, Duration::from_millis),
        };

        // WebSocket (env > toml > default)
        let w = defaults.websocket;
        let websocket = WebsocketConfig {
            url: env_string("BEACON_DEVICE_WS_URL")
                .or(fc.websocket.url)
                .unwrap_or(w.url),
            token: env_string("BEACON_DEVICE_WS_TOKEN").or(fc.websocket.token),
            version: env_parse("BEACON_DEVICE_PROTOCOL_VERSION")
                .or(fc.websocket.version)
                .unwrap_or(w.version),
            device_id: env_string("BEACON_DEVICE_ID")
                .or(fc.websocket.device_id)
                .unwrap_or(w.device_id),
            client_id: env_string("BEACON_DEVICE_CLIENT_ID")
                .or(fc.websocket.client_id)
                .unwrap_or(w.client_id),
            hello_timeout: fc
                .websocket
                .hello_timeout_ms
                .map_or(w.hello_timeout, Duration::from_millis),
            heartbeat_interval: fc
                .websocket
                .heartbeat_interval_ms
                .map_or(w.heartbeat_interval, Duration::from_millis),
            channel_timeout: fc
                .websocket
                .channel_timeout_ms
                .map_or(w.channel_timeout, Duration::from_millis),
        };

        let reconnect = Self::reconnect_policy(&fc.reconnect)?;

        let sounds = SoundConfig {
            dir: env_string("BEACON_DEVICE_SOUNDS_DIR")
                .or(fc.sounds.dir)
                .map(PathBuf::from),
        };

        Ok(Self {
            audio,
            device,
            websocket,
            reconnect,
            sounds,
        })
    }

    /// Resolve the reconnect policy section
    fn reconnect_policy(fc: &file::ReconnectFileConfig) -> Result<ReconnectPolicy> {
        let policy = fc.policy.as_deref().unwrap_or("fixed").to_lowercase();
        match policy.as_str() {
            "disabled" | "off" | "none" => Ok(ReconnectPolicy::Disabled),
            "fixed" | "fixed_interval" => Ok(ReconnectPolicy::FixedInterval {
                interval: Duration::from_millis(fc.interval_ms.unwrap_or(5000)),
                network_reset_threshold: fc.network_reset_threshold.unwrap_or(3),
            }),
            "backoff" => Ok(ReconnectPolicy::Backoff {
                initial: Duration::from_millis(fc.initial_ms.unwrap_or(1000)),
                max: Duration::from_millis(fc.max_ms.unwrap_or(30_000)),
                max_attempts: fc.max_attempts.unwrap_or(5),
            }),
            other => Err(Error::Config(format!("unknown reconnect policy: {other}"))),
        }
    }

    /// Check cross-field invariants
    ///
    /// # Errors
    ///
    /// Returns error describing the first violated constraint
    pub fn validate(&self) -> Result<()> {
        let a = &self.audio;
        if a.encode_queue_depth == 0
            || a.decode_queue_depth == 0
            || a.send_queue_depth == 0
            || a.playback_queue_depth == 0
        {
            return Err(Error::Config("queue depths must be non-zero".to_string()));
        }
        if a.buffer_resume_frames == 0 || a.buffer_start_frames <= a.buffer_resume_frames {
            return Err(Error::Config(format!(
                "buffer start threshold ({}) must exceed resume threshold ({})",
                a.buffer_start_frames, a.buffer_resume_frames
            )));
        }
        if a.frame_duration_ms == 0 {
            return Err(Error::Config("frame duration must be non-zero".to_string()));
        }
        if !(1..=3).contains(&self.websocket.version) {
            return Err(Error::Config(format!(
                "unsupported protocol version: {}",
                self.websocket.version
            )));
        }
        if let ReconnectPolicy::FixedInterval {
            network_reset_threshold: 0,
            ..
        } = self.reconnect
        {
            return Err(Error::Config(
                "network reset threshold must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|s| s.parse().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    env_string(key).map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.audio.send_queue_depth, 40);
        assert_eq!(config.audio.test_queue_depth(), 166);
        assert_eq!(config.audio.frame_samples(), 960);
    }

    #[test]
    fn test_thresholds_must_be_ordered() {
        let mut config = Config::default();
        config.audio.buffer_start_frames = 5;
        config.audio.buffer_resume_frames = 5;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_unknown_protocol_version() {
        let mut config = Config::default();
        config.websocket.version = 4;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_reconnect_policy_from_file() {
        let fc: DeviceConfigFile = toml::from_str(
            r#"
            [reconnect]
            policy = "backoff"
            initial_ms = 500
            "#,
        )
        .unwrap();

        let policy = Config::reconnect_policy(&fc.reconnect).unwrap();
        assert_eq!(
            policy,
            ReconnectPolicy::Backoff {
                initial: Duration::from_millis(500),
                max: Duration::from_secs(30),
                max_attempts: 5,
            }
        );
    }

    #[test]
    fn test_unknown_reconnect_policy() {
        let fc = file::ReconnectFileConfig {
            policy: Some("sometimes".to_string()),
            ..Default::default()
        };
        assert!(Config::reconnect_policy(&fc).is_err());
    }
}
