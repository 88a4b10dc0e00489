//! Broker configuration with validation.
//!
//! Every section defaults sensibly, so an empty TOML document is a valid
//! configuration. Durations use humantime notation (`"30s"`, `"500ms"`).

use crate::domain::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Main broker configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Listener configuration
    pub server: ServerConfig,
    /// Tunnel channel and liveness configuration
    pub tunnel: TunnelConfig,
    /// Dispatch timeouts and admission control
    pub dispatch: DispatchConfig,
    /// HTTP request limits
    pub limits: LimitsConfig,
}

impl BrokerConfig {
    /// Parse configuration from a TOML document
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(format!("{}: {}", path.display(), e)))?;
        let config = Self::from_toml_str(&raw)?;
        info!(path = %path.display(), "Loaded broker configuration");
        Ok(config)
    }

    /// Apply `TUNNEL_*` environment overrides.
    ///
    /// Unparseable values are ignored with a warning.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(host) = lookup("TUNNEL_BROKER_HOST") {
            match host.parse() {
                Ok(h) => self.server.host = h,
                Err(_) => warn!(value = %host, "Ignoring invalid TUNNEL_BROKER_HOST"),
            }
        }
        if let Some(port) = lookup("TUNNEL_BROKER_PORT") {
            match port.parse() {
                Ok(p) => self.server.port = p,
                Err(_) => warn!(value = %port, "Ignoring invalid TUNNEL_BROKER_PORT"),
            }
        }
        if let Some(ms) = lookup("TUNNEL_DEFAULT_TIMEOUT_MS") {
            match ms.parse() {
                Ok(ms) => self.dispatch.default_timeout = Duration::from_millis(ms),
                Err(_) => warn!(value = %ms, "Ignoring invalid TUNNEL_DEFAULT_TIMEOUT_MS"),
            }
        }
        if let Some(max) = lookup("TUNNEL_MAX_PENDING") {
            match max.parse() {
                Ok(max) => self.dispatch.max_pending = max,
                Err(_) => warn!(value = %max, "Ignoring invalid TUNNEL_MAX_PENDING"),
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            ("tunnel.heartbeat_interval", self.tunnel.heartbeat_interval),
            ("tunnel.staleness_threshold", self.tunnel.staleness_threshold),
            ("tunnel.sweep_interval", self.tunnel.sweep_interval),
            ("tunnel.registration_timeout", self.tunnel.registration_timeout),
            ("dispatch.default_timeout", self.dispatch.default_timeout),
            ("dispatch.max_timeout", self.dispatch.max_timeout),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(ConfigError::InvalidDuration(format!("{} cannot be 0", name)));
            }
        }

        // The sweeper must tick at least once inside every staleness window.
        if self.tunnel.sweep_interval >= self.tunnel.staleness_threshold {
            return Err(ConfigError::SweepTooSlow {
                sweep: self.tunnel.sweep_interval,
                staleness: self.tunnel.staleness_threshold,
            });
        }

        if self.tunnel.heartbeat_interval >= self.tunnel.staleness_threshold {
            return Err(ConfigError::InvalidDuration(
                "tunnel.heartbeat_interval must be smaller than tunnel.staleness_threshold"
                    .into(),
            ));
        }

        if self.dispatch.default_timeout > self.dispatch.max_timeout {
            return Err(ConfigError::InvalidDuration(
                "dispatch.default_timeout cannot exceed dispatch.max_timeout".into(),
            ));
        }

        if self.dispatch.max_pending == 0 {
            return Err(ConfigError::InvalidLimit(
                "dispatch.max_pending cannot be 0".into(),
            ));
        }

        if self.tunnel.outbound_buffer == 0 {
            return Err(ConfigError::InvalidLimit(
                "tunnel.outbound_buffer cannot be 0".into(),
            ));
        }

        if self.tunnel.max_frame_size == 0 || self.limits.max_body_size == 0 {
            return Err(ConfigError::InvalidLimit("size limits cannot be 0".into()));
        }

        Ok(())
    }

    /// Listener bind address
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.server.host, self.server.port)
    }
}

/// Listener configuration. Tunnel upgrades and public requests share one port.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address
    pub host: IpAddr,
    /// Port (default: 8080)
    pub port: u16,
    /// Allow cross-origin requests on the public endpoints
    pub cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            port: 8080,
            cors: true,
        }
    }
}

/// Tunnel channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Interval at which workers are expected to heartbeat
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    /// A worker silent for longer than this is evicted
    #[serde(with = "humantime_serde")]
    pub staleness_threshold: Duration,
    /// Heartbeat sweeper tick
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
    /// Window for the first frame of a new channel to be `register`
    #[serde(with = "humantime_serde")]
    pub registration_timeout: Duration,
    /// Per-worker outbound frame queue capacity
    pub outbound_buffer: usize,
    /// Maximum inbound frame size in bytes
    pub max_frame_size: usize,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(20),
            staleness_threshold: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(5),
            registration_timeout: Duration::from_secs(10),
            outbound_buffer: 256,
            max_frame_size: 1024 * 1024,
        }
    }
}

/// Dispatch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Timeout used when the caller gives none
    #[serde(with = "humantime_serde")]
    pub default_timeout: Duration,
    /// Upper bound on caller-supplied timeouts
    #[serde(with = "humantime_serde")]
    pub max_timeout: Duration,
    /// Admission-control cap on in-flight requests
    pub max_pending: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            max_timeout: Duration::from_secs(120),
            max_pending: 1024,
        }
    }
}

impl DispatchConfig {
    /// Resolve a caller-supplied timeout against the default and the cap
    pub fn effective_timeout(&self, requested: Option<Duration>) -> Duration {
        requested
            .unwrap_or(self.default_timeout)
            .min(self.max_timeout)
    }
}

/// HTTP request limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum public request body in bytes
    pub max_body_size: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_body_size: 1024 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config_is_valid() {
        assert!(BrokerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_sweep_must_be_faster_than_staleness() {
        let mut config = BrokerConfig::default();
        config.tunnel.sweep_interval = Duration::from_secs(60);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::SweepTooSlow { .. })
        ));
    }

    #[test]
    fn test_zero_max_pending_rejected() {
        let mut config = BrokerConfig::default();
        config.dispatch.max_pending = 0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidLimit(_))));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut config = BrokerConfig::default();
        config.dispatch.default_timeout = Duration::ZERO;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidDuration(_))
        ));
    }

    #[test]
    fn test_parse_toml_with_humantime() {
        let config = BrokerConfig::from_toml_str(
            r#"
            [server]
            port = 9000

            [tunnel]
            staleness_threshold = "45s"
            sweep_interval = "500ms"

            [dispatch]
            default_timeout = "5s"
            max_pending = 8
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.tunnel.staleness_threshold, Duration::from_secs(45));
        assert_eq!(config.tunnel.sweep_interval, Duration::from_millis(500));
        assert_eq!(config.dispatch.default_timeout, Duration::from_secs(5));
        assert_eq!(config.dispatch.max_pending, 8);
        // Untouched sections keep their defaults
        assert_eq!(config.tunnel.outbound_buffer, 256);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_toml_is_default() {
        let config = BrokerConfig::from_toml_str("").unwrap();
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("TUNNEL_BROKER_PORT", "7000"),
            ("TUNNEL_DEFAULT_TIMEOUT_MS", "1500"),
            ("TUNNEL_MAX_PENDING", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let mut config = BrokerConfig::default();
        config.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.server.port, 7000);
        assert_eq!(config.dispatch.default_timeout, Duration::from_millis(1500));
        assert_eq!(config.dispatch.max_pending, 1024);
    }

    #[test]
    fn test_effective_timeout_clamped() {
        let dispatch = DispatchConfig::default();
        assert_eq!(dispatch.effective_timeout(None), Duration::from_secs(30));
        assert_eq!(
            dispatch.effective_timeout(Some(Duration::from_secs(5))),
            Duration::from_secs(5)
        );
        assert_eq!(
            dispatch.effective_timeout(Some(Duration::from_secs(600))),
            Duration::from_secs(120)
        );
    }
}
