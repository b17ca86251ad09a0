//! Stream configuration
//!
//! Configuration is plain serde data so it can be embedded in a host
//! application's own config file. Every field has a default, so an empty
//! JSON object is a valid configuration.

use crate::error::{Result, StreamError};
use crate::queue::TimerId;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Reconnect backoff parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay after the first failure (default: 1s)
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Upper bound for the delay (default: 60s)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Growth factor applied after every attempt (default: 1.5)
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Jitter as a fraction of the current delay, in `[0, 1]` (default: 0.5)
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_multiplier() -> f64 {
    1.5
}

fn default_jitter_factor() -> f64 {
    0.5
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter_factor: default_jitter_factor(),
        }
    }
}

impl BackoffConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Check the parameters for consistency
    pub fn validate(&self) -> Result<()> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(StreamError::Config(format!(
                "backoff multiplier must be finite and at least 1.0, got {}",
                self.multiplier
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(StreamError::Config(format!(
                "backoff jitter factor must be within [0, 1], got {}",
                self.jitter_factor
            )));
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(StreamError::Config(format!(
                "initial backoff delay ({}ms) exceeds max delay ({}ms)",
                self.initial_delay_ms, self.max_delay_ms
            )));
        }
        Ok(())
    }
}

/// Per-stream settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Name used in logs and errors
    #[serde(default = "default_debug_name")]
    pub debug_name: String,

    /// How long an open stream may stay idle before it is stopped (default: 60s)
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// Timer the idle check is scheduled under
    #[serde(default = "default_idle_timer_id")]
    pub idle_timer_id: TimerId,

    /// Timer the reconnect backoff is scheduled under
    #[serde(default = "default_backoff_timer_id")]
    pub backoff_timer_id: TimerId,

    #[serde(default)]
    pub backoff: BackoffConfig,
}

fn default_debug_name() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("stream-{}", &id[..8])
}

fn default_idle_timeout_ms() -> u64 {
    60_000
}

fn default_idle_timer_id() -> TimerId {
    TimerId::ListenStreamIdle
}

fn default_backoff_timer_id() -> TimerId {
    TimerId::ListenStreamConnectionBackoff
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            debug_name: default_debug_name(),
            idle_timeout_ms: default_idle_timeout_ms(),
            idle_timer_id: default_idle_timer_id(),
            backoff_timer_id: default_backoff_timer_id(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl StreamConfig {
    /// Settings for a listen (watch) stream
    pub fn listen() -> Self {
        Self {
            debug_name: "listen".to_string(),
            idle_timer_id: TimerId::ListenStreamIdle,
            backoff_timer_id: TimerId::ListenStreamConnectionBackoff,
            ..Default::default()
        }
    }

    /// Settings for a write stream
    pub fn write() -> Self {
        Self {
            debug_name: "write".to_string(),
            idle_timer_id: TimerId::WriteStreamIdle,
            backoff_timer_id: TimerId::WriteStreamConnectionBackoff,
            ..Default::default()
        }
    }

    /// Parse and validate a JSON configuration
    pub fn from_json(json: &str) -> Result<Self> {
        let config: StreamConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Check the settings for consistency
    pub fn validate(&self) -> Result<()> {
        if self.idle_timer_id == self.backoff_timer_id {
            return Err(StreamError::Config(format!(
                "idle and backoff timers of '{}' must differ, both are {:?}",
                self.debug_name, self.idle_timer_id
            )));
        }
        self.backoff.validate()
    }
}
