//! Audio channel recovery
//!
//! The timer only queues [`Command::ReconnectTick`]; every attempt runs on the
//! control loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use super::events::{Command, ControlSignals};
use crate::config::ReconnectPolicy;

/// What the control loop should do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Another tick is coming
    Retry,

    /// Attempts are exhausted; the timer is stopped
    GiveUp,
}

#[derive(Debug)]
pub struct Reconnector {
    policy: ReconnectPolicy,
    failures: u32,
    timer: Option<JoinHandle<()>>,
}

impl Reconnector {
    #[must_use]
    pub const fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            failures: 0,
            timer: None,
        }
    }

    #[must_use]
    pub const fn policy(&self) -> ReconnectPolicy {
        self.policy
    }

    /// Consecutive failed attempts since the timer started
    #[must_use]
    pub const fn failures(&self) -> u32 {
        self.failures
    }

    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.timer.is_some()
    }

    /// Arm the timer; no-op when disabled or already running
    pub fn start(&mut self, signals: &Arc<ControlSignals>) {
        if self.timer.is_some() {
            return;
        }
        self.failures = 0;
        match self.policy {
            ReconnectPolicy::Disabled => {}
            ReconnectPolicy::FixedInterval { interval, .. } => {
                tracing::info!(interval_ms = interval.as_millis(), "reconnect timer started");
                self.timer = Some(spawn_periodic(Arc::clone(signals), interval));
            }
            ReconnectPolicy::Backoff { initial, .. } => {
                tracing::info!(delay_ms = initial.as_millis(), "reconnect timer started");
                self.timer = Some(spawn_once(Arc::clone(signals), initial));
            }
        }
    }

    /// Cancel the timer and forget failures
    pub fn stop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
            tracing::debug!(failures = self.failures, "reconnect timer stopped");
        }
        self.failures = 0;
    }

    /// Whether the network interface should be reset before the next attempt
    #[must_use]
    pub const fn should_reset_network(&self) -> bool {
        match self.policy {
            ReconnectPolicy::FixedInterval {
                network_reset_threshold,
                ..
            } => network_reset_threshold > 0 && self.failures > 0 && self.failures % network_reset_threshold == 0,
            _ => false,
        }
    }

    /// Record a failed attempt and re-arm as the policy dictates
    pub fn record_failure(&mut self, signals: &Arc<ControlSignals>) -> RetryOutcome {
        self.failures = self.failures.saturating_add(1);
        match self.policy {
            ReconnectPolicy::Disabled => {
                self.stop();
                RetryOutcome::GiveUp
            }
            ReconnectPolicy::FixedInterval { .. } => RetryOutcome::Retry,
            ReconnectPolicy::Backoff {
                initial,
                max,
                max_attempts,
            } => {
                if self.failures >= max_attempts {
                    tracing::warn!(attempts = self.failures, "reconnect attempts exhausted");
                    self.stop();
                    return RetryOutcome::GiveUp;
                }
                let delay = backoff_delay(initial, max, self.failures);
                tracing::debug!(failures = self.failures, delay_ms = delay.as_millis(), "reconnect backoff");
                if let Some(timer) = self.timer.take() {
                    timer.abort();
                }
                self.timer = Some(spawn_once(Arc::clone(signals), delay));
                RetryOutcome::Retry
            }
        }
    }
}

impl Drop for Reconnector {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Delay before the attempt following `failures` failures
#[must_use]
pub fn backoff_delay(initial: Duration, max: Duration, failures: u32) -> Duration {
    let factor = 2u32.saturating_pow(failures.min(16));
    initial.saturating_mul(factor).min(max)
}

fn spawn_periodic(signals: Arc<ControlSignals>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        loop {
            ticker.tick().await;
            signals.schedule(Command::ReconnectTick);
        }
    })
}

fn spawn_once(signals: Arc<ControlSignals>, delay: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        signals.schedule(Command::ReconnectTick);
    })
}
