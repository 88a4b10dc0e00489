//! Worker configuration.

use std::time::Duration;
use tunnel_broker::WorkerMetadata;

/// Default heartbeat interval, matching the broker's default expectation
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);

/// Base delay between reconnection attempts (exponential backoff)
pub const DEFAULT_RECONNECT_BASE_DELAY: Duration = Duration::from_secs(2);

/// Maximum delay between reconnection attempts
pub const DEFAULT_RECONNECT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Reverse client configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Broker tunnel endpoint, e.g. `ws://broker.example:8080/tunnel`
    pub broker_url: String,
    /// Sent with `register`; shown on the broker's `/workers`
    pub metadata: WorkerMetadata,
    pub heartbeat_interval: Duration,
    /// How long to wait for `register_ack`
    pub register_timeout: Duration,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    /// Consecutive failed sessions before giving up; `None` retries forever
    pub max_reconnect_attempts: Option<u32>,
    /// Capacity of the outbound frame queue
    pub outbound_buffer: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            broker_url: "ws://127.0.0.1:8080/tunnel".to_string(),
            metadata: WorkerMetadata::new(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            register_timeout: Duration::from_secs(10),
            reconnect_base_delay: DEFAULT_RECONNECT_BASE_DELAY,
            reconnect_max_delay: DEFAULT_RECONNECT_MAX_DELAY,
            max_reconnect_attempts: None,
            outbound_buffer: 256,
        }
    }
}

impl WorkerConfig {
    pub fn new(broker_url: impl Into<String>) -> Self {
        Self {
            broker_url: broker_url.into(),
            ..Self::default()
        }
    }

    /// Add one metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Delay before reconnect attempt number `attempts` (0 after a clean session)
    pub fn backoff_delay(&self, attempts: u32) -> Duration {
        self.reconnect_base_delay
            .saturating_mul(1 << attempts.min(16))
            .min(self.reconnect_max_delay)
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(self.broker_url.starts_with("ws://") || self.broker_url.starts_with("wss://")) {
            return Err(format!("broker_url must be a ws:// or wss:// URL: {}", self.broker_url));
        }
        if self.heartbeat_interval.is_zero() || self.register_timeout.is_zero() {
            return Err("heartbeat_interval and register_timeout cannot be 0".into());
        }
        if self.reconnect_base_delay > self.reconnect_max_delay {
            return Err("reconnect_base_delay cannot exceed reconnect_max_delay".into());
        }
        if self.outbound_buffer == 0 {
            return Err("outbound_buffer cannot be 0".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(WorkerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_http_url() {
        let config = WorkerConfig::new("http://broker/tunnel");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let config = WorkerConfig::default();
        assert_eq!(config.backoff_delay(0), Duration::from_secs(2));
        assert_eq!(config.backoff_delay(1), Duration::from_secs(4));
        assert_eq!(config.backoff_delay(3), Duration::from_secs(16));
        assert_eq!(config.backoff_delay(5), Duration::from_secs(60));
        assert_eq!(config.backoff_delay(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_with_metadata() {
        let config = WorkerConfig::default().with_metadata("addr", "10.0.0.5");
        assert_eq!(config.metadata.get("addr").map(String::as_str), Some("10.0.0.5"));
    }
}
