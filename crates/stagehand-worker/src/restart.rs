//! Restart policy.
//!
//! Restarts are either requested by the operator or triggered automatically
//! (fatal output, error threshold, process exit). Automatic restarts count
//! toward a streak that drives exponential backoff and the optional attempt
//! ceiling; an operator restart resets the streak.

use serde::{Deserialize, Serialize};
use stagehand_core::config::RestartConfig;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Why an automatic restart was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartReason {
    /// A fatal pattern matched an output line
    FatalOutput,
    /// Consecutive recoverable errors reached the threshold
    ErrorThreshold,
    /// The process exited on its own
    ProcessExit,
}

impl fmt::Display for RestartReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FatalOutput => write!(f, "fatal output"),
            Self::ErrorThreshold => write!(f, "error threshold"),
            Self::ProcessExit => write!(f, "process exit"),
        }
    }
}

/// Who asked for a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartOrigin {
    /// Console command; always proceeds and resets the streak
    Operator,
    /// Health monitor
    Automatic(RestartReason),
}

/// Outcome of asking a slot to begin a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Go ahead, waiting `delay` before relaunch
    Proceed { delay: Duration },
    /// An automatic restart is already in flight for this slot
    AlreadyRestarting,
    /// The automatic restart ceiling was reached; the slot is now in error
    CeilingReached,
}

/// Delay, backoff and ceiling for restarts.
#[derive(Debug, Clone, PartialEq)]
pub struct RestartPolicy {
    /// Base delay between cleanup and relaunch
    pub delay: Duration,
    /// Automatic restarts allowed in a row
    pub max_attempts: Option<u32>,
    /// Delay multiplier per consecutive automatic restart
    pub backoff_factor: f64,
    /// Delay cap
    pub max_delay: Duration,
    /// Kill sibling processes before relaunching parallel slots
    pub kill_siblings: bool,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::from_config(&RestartConfig::default())
    }
}

impl RestartPolicy {
    pub fn from_config(config: &RestartConfig) -> Self {
        Self {
            delay: config.delay,
            max_attempts: config.max_attempts,
            backoff_factor: config.backoff_factor,
            max_delay: config.max_delay,
            kill_siblings: config.kill_siblings,
        }
    }

    /// Delay before the relaunch that makes `streak` automatic restarts in a row.
    ///
    /// `streak` 0 and 1 both use the base delay.
    pub fn delay_for(&self, streak: u32) -> Duration {
        let exponent = streak.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.backoff_factor.powi(exponent);
        let secs = self.delay.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay.max(self.delay);
        }
        Duration::from_secs_f64(secs)
    }

    /// Whether another automatic restart is allowed after `streak` in a row.
    pub fn allows(&self, streak: u32) -> bool {
        self.max_attempts.is_none_or(|max| streak < max)
    }
}

/// Process-wide stop flag observed by monitors, restarts and the scan loop.
#[derive(Debug, Clone)]
pub struct ShutdownFlag {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for ShutdownFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownFlag {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Set the flag. Returns true if it was already set.
    pub fn trigger(&self) -> bool {
        self.tx.send_replace(true)
    }

    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once the flag is set.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}
