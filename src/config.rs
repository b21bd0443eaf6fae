use std::time::Duration;

use crate::error::{AzmError, Result};
use crate::keepalive::DEVICE_INACTIVITY_TIMEOUT;

/// Default TCP control port
pub const DEFAULT_TCP_PORT: u16 = 5321;

/// Default UDP meter port
pub const DEFAULT_UDP_PORT: u16 = 3131;

/// Options for an [`AzmClient`](crate::AzmClient)
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Device hostname or IP address
    pub host: String,
    /// TCP control port
    pub tcp_port: u16,
    /// Local UDP port meters are pushed to (0 picks a free one)
    pub udp_port: u16,
    /// Limit for establishing the TCP connection
    pub connect_timeout: Duration,
    /// Limit for a correlated reply
    pub request_timeout: Duration,
    /// How often pending requests are checked for expiry
    pub sweep_interval: Duration,
    /// Time between keep-alives; must stay below the device's 5 minute timeout
    pub keepalive_interval: Duration,
    /// Consecutive keep-alive timeouts that count as a dead link
    pub keepalive_max_misses: u32,
    /// How long same-method requests are coalesced before flushing
    pub batch_window: Duration,
    /// Most entries in one array-form request
    pub max_batch_size: usize,
    /// Minimum spacing between flushed batches
    pub min_batch_interval: Duration,
    /// First reconnect delay
    pub backoff_floor: Duration,
    /// Largest reconnect delay
    pub backoff_ceiling: Duration,
    /// Uptime after which the reconnect delay starts over from the floor
    pub stability_threshold: Duration,
    /// Pause after connecting before the first write
    pub settle_delay: Duration,
    /// Follow every new subscription with a `get` for its current value
    pub prime_on_subscribe: bool,
    /// Delay before rebinding a failed meter socket
    pub meter_rebind_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            tcp_port: DEFAULT_TCP_PORT,
            udp_port: DEFAULT_UDP_PORT,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            sweep_interval: Duration::from_millis(250),
            keepalive_interval: Duration::from_secs(240),
            keepalive_max_misses: 2,
            batch_window: Duration::from_millis(50),
            max_batch_size: 32,
            min_batch_interval: Duration::from_millis(50),
            backoff_floor: Duration::from_secs(1),
            backoff_ceiling: Duration::from_secs(60),
            stability_threshold: Duration::from_secs(30),
            settle_delay: Duration::from_millis(500),
            prime_on_subscribe: true,
            meter_rebind_delay: Duration::from_secs(1),
        }
    }
}

impl ClientConfig {
    /// Defaults for the device at `host`
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Self::default()
        }
    }

    /// Override both ports
    pub fn with_ports(mut self, tcp_port: u16, udp_port: u16) -> Self {
        self.tcp_port = tcp_port;
        self.udp_port = udp_port;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(AzmError::Config("host cannot be empty".to_string()));
        }
        if self.tcp_port == 0 {
            return Err(AzmError::Config("TCP port cannot be zero".to_string()));
        }
        if self.keepalive_interval.is_zero()
            || self.keepalive_interval >= DEVICE_INACTIVITY_TIMEOUT
        {
            return Err(AzmError::Config(format!(
                "keep-alive interval must be between 0 and {:?}",
                DEVICE_INACTIVITY_TIMEOUT
            )));
        }
        if self.keepalive_max_misses == 0 {
            return Err(AzmError::Config("keep-alive miss limit must be at least 1".to_string()));
        }
        if self.request_timeout.is_zero() || self.sweep_interval.is_zero() {
            return Err(AzmError::Config(
                "request timeout and sweep interval must be greater than zero".to_string(),
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(AzmError::Config("connect timeout must be greater than zero".to_string()));
        }
        if self.max_batch_size == 0 {
            return Err(AzmError::Config("batch size must be at least 1".to_string()));
        }
        if self.backoff_floor.is_zero() || self.backoff_floor > self.backoff_ceiling {
            return Err(AzmError::Config(
                "backoff floor must be non-zero and not above the ceiling".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ClientConfig::new("192.168.1.50");
        assert!(config.validate().is_ok());
        assert_eq!(config.tcp_port, 5321);
        assert_eq!(config.udp_port, 3131);
        assert_eq!(config.keepalive_interval, Duration::from_secs(240));
    }

    #[test]
    fn rejects_keepalive_at_device_timeout() {
        let config = ClientConfig {
            keepalive_interval: Duration::from_secs(300),
            ..ClientConfig::new("azm")
        };
        assert!(matches!(config.validate(), Err(AzmError::Config(_))));
    }

    #[test]
    fn rejects_inverted_backoff_and_empty_host() {
        let config = ClientConfig {
            backoff_floor: Duration::from_secs(10),
            backoff_ceiling: Duration::from_secs(5),
            ..ClientConfig::default()
        };
        assert!(config.validate().is_err());
        assert!(ClientConfig::new("").validate().is_err());
        assert!(ClientConfig::new("azm").with_ports(0, 3131).validate().is_err());
    }
}
