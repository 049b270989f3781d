//! Dispatcher configuration, loadable from TOML or built programmatically.

use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_call_timeout_secs() -> f64 {
    5.0
}
fn default_connect_timeout_secs() -> f64 {
    5.0
}
fn default_queue_flush_interval_secs() -> f64 {
    0.1
}
fn default_queue_max_batch_size() -> usize {
    100
}
fn default_queue_max_wait_secs() -> f64 {
    1.0
}
fn default_circuit_failure_threshold() -> u32 {
    3
}
fn default_circuit_recovery_timeout_secs() -> f64 {
    30.0
}
fn default_circuit_half_open_max_calls() -> u32 {
    1
}
fn default_circuit_success_threshold() -> u32 {
    1
}

/// Every tunable the dispatcher, its channels, breaker, and queue accept.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Deadline applied to every RPC call.
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: f64,
    /// Deadline applied to channel connect attempts.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: f64,
    /// How often the operation queue wakes to drain pending ops.
    #[serde(default = "default_queue_flush_interval_secs")]
    pub queue_flush_interval_secs: f64,
    /// Maximum number of ops drained in a single flush.
    #[serde(default = "default_queue_max_batch_size")]
    pub queue_max_batch_size: usize,
    /// Maximum time a pending op may wait before it is eligible to flush
    /// regardless of batch position.
    #[serde(default = "default_queue_max_wait_secs")]
    pub queue_max_wait_secs: f64,
    /// Consecutive failures before a node's breaker opens.
    #[serde(default = "default_circuit_failure_threshold")]
    pub circuit_failure_threshold: u32,
    /// Seconds an open breaker waits before allowing a half-open probe.
    #[serde(default = "default_circuit_recovery_timeout_secs")]
    pub circuit_recovery_timeout_secs: f64,
    /// Concurrent probe calls allowed while half-open.
    #[serde(default = "default_circuit_half_open_max_calls")]
    pub circuit_half_open_max_calls: u32,
    /// Consecutive half-open successes required to close the breaker.
    #[serde(default = "default_circuit_success_threshold")]
    pub circuit_success_threshold: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            call_timeout_secs: default_call_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            queue_flush_interval_secs: default_queue_flush_interval_secs(),
            queue_max_batch_size: default_queue_max_batch_size(),
            queue_max_wait_secs: default_queue_max_wait_secs(),
            circuit_failure_threshold: default_circuit_failure_threshold(),
            circuit_recovery_timeout_secs: default_circuit_recovery_timeout_secs(),
            circuit_half_open_max_calls: default_circuit_half_open_max_calls(),
            circuit_success_threshold: default_circuit_success_threshold(),
        }
    }
}

impl DispatcherConfig {
    /// Parse a config from a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    /// Load and parse a config from a TOML file on disk.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> std::io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.call_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.connect_timeout_secs)
    }

    pub fn queue_flush_interval(&self) -> Duration {
        Duration::from_secs_f64(self.queue_flush_interval_secs)
    }

    pub fn queue_max_wait(&self) -> Duration {
        Duration::from_secs_f64(self.queue_max_wait_secs)
    }

    pub fn circuit_recovery_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.circuit_recovery_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = DispatcherConfig::default();
        assert_eq!(cfg.call_timeout_secs, 5.0);
        assert_eq!(cfg.connect_timeout_secs, 5.0);
        assert_eq!(cfg.queue_flush_interval_secs, 0.1);
        assert_eq!(cfg.queue_max_batch_size, 100);
        assert_eq!(cfg.queue_max_wait_secs, 1.0);
        assert_eq!(cfg.circuit_failure_threshold, 3);
        assert_eq!(cfg.circuit_recovery_timeout_secs, 30.0);
        assert_eq!(cfg.circuit_half_open_max_calls, 1);
        assert_eq!(cfg.circuit_success_threshold, 1);
    }

    #[test]
    fn parses_partial_toml_with_defaults() {
        let cfg = DispatcherConfig::from_toml_str("circuit_failure_threshold = 5\n").unwrap();
        assert_eq!(cfg.circuit_failure_threshold, 5);
        assert_eq!(cfg.call_timeout_secs, 5.0);
    }
}
