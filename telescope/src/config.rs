//! Tunables shared by every connection
//!
//! All fields have working defaults; a JSON file only needs the keys it
//! changes.

use crate::error::StoreError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Reconnection configuration with jitter support
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectionConfig {
    /// Reconnect after a lost or failed connection
    pub enabled: bool,
    /// Base delay for exponential backoff
    pub base_delay_ms: u64,
    /// Maximum delay cap
    pub max_delay_ms: u64,
    /// Whether to add jitter (randomness) so several mounts don't retry in lockstep
    pub use_jitter: bool,
    /// Jitter factor (0.0 to 1.0, default 0.3 = 30% variation)
    pub jitter_factor: f64,
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            use_jitter: true,
            jitter_factor: 0.3,
        }
    }
}

impl ReconnectionConfig {
    /// Calculate delay for a given attempt number with optional jitter
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        // base * 2^(attempt-1), capped
        let base = Duration::from_millis(self.base_delay_ms);
        let max = Duration::from_millis(self.max_delay_ms);

        let exponential_delay = 2u32
            .checked_pow(attempt.saturating_sub(1))
            .and_then(|factor| base.checked_mul(factor))
            .unwrap_or(max)
            .min(max);

        if self.use_jitter && self.jitter_factor > 0.0 {
            // Range [delay * (1 - jitter/2), delay * (1 + jitter/2)]
            let jitter_range = exponential_delay.as_secs_f64() * self.jitter_factor;
            let random_factor = rand::thread_rng().gen::<f64>() * jitter_range - (jitter_range / 2.0);
            let jittered_secs = (exponential_delay.as_secs_f64() + random_factor).max(0.1);
            Duration::from_secs_f64(jittered_secs.min(max.as_secs_f64()))
        } else {
            exponential_delay
        }
    }
}

/// Connection tunables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Window for a transport to become established
    pub connect_timeout_ms: u64,
    /// A streaming link that stays silent this long counts as lost
    pub idle_timeout_ms: u64,
    pub reconnection: ReconnectionConfig,
    /// Position poll cadence for Celestron hand controllers
    pub nexstar_poll_interval_ms: u64,
    /// Time a Celestron hand controller has to answer a command
    pub nexstar_answer_timeout_ms: u64,
    pub serial_baud_rate: u32,
    /// Largest single INDI message accepted before the parser resets
    pub indi_buffer_capacity: usize,
    /// Outgoing buffer size for INDI connections
    pub indi_outbox_capacity: usize,
    /// Connection event channel size
    pub event_capacity: usize,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            idle_timeout_ms: 10_000,
            reconnection: ReconnectionConfig::default(),
            nexstar_poll_interval_ms: 500,
            nexstar_answer_timeout_ms: 2_000,
            serial_baud_rate: 9_600,
            indi_buffer_capacity: scopelink_indi::DEFAULT_BUFFER_CAPACITY,
            indi_outbox_capacity: 64 * 1024,
            event_capacity: 256,
        }
    }
}

impl ControlConfig {
    /// Read a configuration file; missing keys keep their defaults
    pub fn from_json_file(path: &Path) -> Result<Self, StoreError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn nexstar_poll_interval(&self) -> Duration {
        Duration::from_millis(self.nexstar_poll_interval_ms)
    }

    pub fn nexstar_answer_timeout(&self) -> Duration {
        Duration::from_millis(self.nexstar_answer_timeout_ms)
    }
}
