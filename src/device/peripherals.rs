//! Board peripherals the control loop drives
//!
//! Screens, LEDs and network hardware differ per board. The host build backs
//! every port with tracing output, and tests substitute recorders.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Notify;

use super::state::DeviceState;

/// What the screen shows in its main area
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayMode {
    Emotion,
    Chat,
}

impl std::fmt::Display for DisplayMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Emotion => write!(f, "emotion"),
            Self::Chat => write!(f, "chat"),
        }
    }
}

/// Status line, chat bubble and emotion face
pub trait Display: Send + Sync {
    fn set_status(&self, status: &str);

    /// `role` is `user`, `assistant` or `system`; empty content clears
    fn set_chat_message(&self, role: &str, content: &str);

    fn set_emotion(&self, emotion: &str);

    fn set_display_mode(&self, mode: DisplayMode);

    /// Refresh clock, battery and network icons
    fn update_status_bar(&self, _update_all: bool) {}
}

pub trait Led: Send + Sync {
    fn on_state_changed(&self, state: DeviceState);
}

/// Board-level controls
pub trait Board: Send + Sync {
    /// Reset the network interface; returns whether it came back
    fn reset_network(&self) -> bool;

    fn reboot(&self);

    fn set_power_save_mode(&self, enabled: bool);
}

/// Tool-call payloads from the server
pub trait McpHandler: Send + Sync {
    fn handle(&self, payload: &Value);
}

/// The set of ports handed to the application
#[derive(Clone)]
pub struct Peripherals {
    pub display: Arc<dyn Display>,
    pub led: Arc<dyn Led>,
    pub board: Arc<dyn Board>,
    pub mcp: Arc<dyn McpHandler>,
}

impl Peripherals {
    /// Host peripherals that log instead of driving hardware
    #[must_use]
    pub fn logging(board: Arc<HostBoard>) -> Self {
        Self {
            display: Arc::new(LogDisplay),
            led: Arc::new(LogLed),
            board,
            mcp: Arc::new(LogMcp),
        }
    }
}

#[derive(Debug, Default)]
pub struct LogDisplay;

impl Display for LogDisplay {
    fn set_status(&self, status: &str) {
        tracing::info!(status, "display status");
    }

    fn set_chat_message(&self, role: &str, content: &str) {
        if !content.is_empty() {
            tracing::info!(role, content, "chat");
        }
    }

    fn set_emotion(&self, emotion: &str) {
        tracing::debug!(emotion, "display emotion");
    }

    fn set_display_mode(&self, mode: DisplayMode) {
        tracing::debug!(%mode, "display mode");
    }
}

#[derive(Debug, Default)]
pub struct LogLed;

impl Led for LogLed {
    fn on_state_changed(&self, state: DeviceState) {
        tracing::trace!(%state, "led");
    }
}

#[derive(Debug, Default)]
pub struct LogMcp;

impl McpHandler for LogMcp {
    fn handle(&self, payload: &Value) {
        tracing::info!(%payload, "mcp message");
    }
}

/// Host board; a reboot request wakes whoever waits on [`HostBoard::reboot_requested`]
#[derive(Debug, Default)]
pub struct HostBoard {
    reboot: Notify,
}

impl HostBoard {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves once a reboot has been requested
    pub async fn reboot_requested(&self) {
        self.reboot.notified().await;
    }
}

impl Board for HostBoard {
    fn reset_network(&self) -> bool {
        tracing::warn!("network reset requested; host networking is left to the OS");
        true
    }

    fn reboot(&self) {
        tracing::warn!("reboot requested");
        self.reboot.notify_one();
    }

    fn set_power_save_mode(&self, enabled: bool) {
        tracing::debug!(enabled, "power save mode");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reboot_wakes_waiter() {
        let board = Arc::new(HostBoard::new());
        board.reboot();
        tokio::time::timeout(std::time::Duration::from_secs(1), board.reboot_requested())
            .await
            .unwrap();
    }

    #[test]
    fn test_display_mode_names() {
        assert_eq!(DisplayMode::Emotion.to_string(), "emotion");
        assert_eq!(DisplayMode::Chat.to_string(), "chat");
    }
}
