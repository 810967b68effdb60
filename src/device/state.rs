//! Device state, listening mode and echo cancellation mode

use std::fmt;

/// Device-wide state, owned by the control loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum DeviceState {
    #[default]
    Unknown = 0,
    Starting,
    WifiConfiguring,
    Idle,
    Connecting,
    Listening,
    Speaking,
    Upgrading,
    Activating,
    AudioTesting,
    FatalError,
}

impl DeviceState {
    const ALL: [Self; 11] = [
        Self::Unknown,
        Self::Starting,
        Self::WifiConfiguring,
        Self::Idle,
        Self::Connecting,
        Self::Listening,
        Self::Speaking,
        Self::Upgrading,
        Self::Activating,
        Self::AudioTesting,
        Self::FatalError,
    ];

    /// Compact form for atomic snapshots
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Inverse of [`Self::as_u8`]; out-of-range values map to `Unknown`
    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        Self::ALL
            .get(usize::from(value))
            .copied()
            .unwrap_or(Self::Unknown)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Starting => "starting",
            Self::WifiConfiguring => "wifi_configuring",
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Listening => "listening",
            Self::Speaking => "speaking",
            Self::Upgrading => "upgrading",
            Self::Activating => "activating",
            Self::AudioTesting => "audio_testing",
            Self::FatalError => "fatal_error",
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a listening turn ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListeningMode {
    /// Explicit stop from the user
    ManualStop,

    /// Server-side endpointing ends the turn
    #[default]
    AutoStop,

    /// Continuous, no local endpointing
    Realtime,
}

impl ListeningMode {
    /// Wire name used in `listen` messages
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ManualStop => "manual",
            Self::AutoStop => "auto",
            Self::Realtime => "realtime",
        }
    }
}

impl fmt::Display for ListeningMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where echo cancellation happens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AecMode {
    #[default]
    Off,

    /// Voice processor cancels echo on the device
    OnDeviceSide,

    /// Server correlates played timestamps with captured audio
    OnServerSide,
}

impl AecMode {
    /// Parse from string representation
    #[must_use]
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "device" | "on_device" | "device_side" => Self::OnDeviceSide,
            "server" | "on_server" | "server_side" => Self::OnServerSide,
            _ => Self::Off,
        }
    }

    /// Listening mode a wake word or toggle starts
    #[must_use]
    pub const fn listening_mode(self) -> ListeningMode {
        match self {
            Self::Off => ListeningMode::AutoStop,
            Self::OnDeviceSide | Self::OnServerSide => ListeningMode::Realtime,
        }
    }
}

impl fmt::Display for AecMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Off => write!(f, "off"),
            Self::OnDeviceSide => write!(f, "device"),
            Self::OnServerSide => write!(f, "server"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_u8_round_trip() {
        for state in DeviceState::ALL {
            assert_eq!(DeviceState::from_u8(state.as_u8()), state);
        }
        assert_eq!(DeviceState::from_u8(200), DeviceState::Unknown);
    }

    #[test]
    fn test_aec_mode_parsing() {
        assert_eq!(AecMode::from_str("Device"), AecMode::OnDeviceSide);
        assert_eq!(AecMode::from_str("server"), AecMode::OnServerSide);
        assert_eq!(AecMode::from_str("bogus"), AecMode::Off);
        assert_eq!(AecMode::OnServerSide.to_string(), "server");
    }

    #[test]
    fn test_listening_mode_follows_aec() {
        assert_eq!(AecMode::Off.listening_mode(), ListeningMode::AutoStop);
        assert_eq!(AecMode::OnDeviceSide.listening_mode(), ListeningMode::Realtime);
        assert_eq!(ListeningMode::ManualStop.to_string(), "manual");
    }
}
