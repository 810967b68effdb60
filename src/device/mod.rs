//! Device control
//!
//! The state machine, its signalling, the ports it drives and the reconnect
//! policy.

mod application;
mod dispatch;
pub mod events;
mod handle;
pub mod peripherals;
pub mod reconnect;
mod state;

pub use application::Application;
pub use events::{Command, StateChange};
pub use handle::DeviceHandle;
pub use peripherals::{Board, Display, DisplayMode, HostBoard, Led, McpHandler, Peripherals};
pub use reconnect::{Reconnector, RetryOutcome};
pub use state::{AecMode, DeviceState, ListeningMode};
