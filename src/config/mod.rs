//! Configuration module - environment variable parsing

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::util::rate_limit::INPUT_RATE_LIMIT;

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    /// Server binding address
    pub server_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Emit logs as JSON lines instead of human-readable text
    pub log_json: bool,
    /// Allowed client origins for CORS (comma-separated); permissive when unset
    pub client_origin: Option<String>,

    /// Maximum players per room
    pub room_capacity: usize,
    /// Simulation ticks per second
    pub tick_rate: u32,
    /// How many times a join retries matchmaking after losing an admission race
    pub admission_retries: u32,

    /// Length of a connection statistics window
    pub stats_interval: Duration,
    /// Interval between transport pings
    pub heartbeat_interval: Duration,
    /// Connections silent for longer than this are closed
    pub idle_timeout: Duration,
    /// Outbound frames queued per connection before new frames are dropped
    pub outbound_buffer: usize,
    /// Binary input frames accepted per connection per second
    pub input_rate_limit: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            log_level: "info".to_string(),
            log_json: false,
            client_origin: None,
            room_capacity: 8,
            tick_rate: 30,
            admission_retries: 1,
            stats_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(30),
            outbound_buffer: 64,
            input_rate_limit: INPUT_RATE_LIMIT,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        // Cloud hosts provide PORT, fall back to SERVER_ADDR or default
        let server_addr = if let Ok(port) = env::var("PORT") {
            format!("0.0.0.0:{}", port)
        } else {
            env::var("SERVER_ADDR").unwrap_or_else(|_| defaults.server_addr.to_string())
        };

        let config = Self {
            server_addr: server_addr
                .parse()
                .map_err(|_| ConfigError::InvalidAddress)?,

            log_level: env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
            log_json: env::var("LOG_FORMAT")
                .map(|format| format.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
            client_origin: env::var("CLIENT_ORIGIN")
                .ok()
                .filter(|origin| !origin.trim().is_empty()),

            room_capacity: parse_var("ROOM_CAPACITY", defaults.room_capacity)?,
            tick_rate: parse_var("TICK_RATE", defaults.tick_rate)?,
            admission_retries: parse_var("ADMISSION_RETRIES", defaults.admission_retries)?,

            stats_interval: Duration::from_millis(parse_var("STATS_INTERVAL_MS", 1000u64)?),
            heartbeat_interval: Duration::from_secs(parse_var("HEARTBEAT_INTERVAL_SECS", 5u64)?),
            idle_timeout: Duration::from_secs(parse_var("IDLE_TIMEOUT_SECS", 30u64)?),
            outbound_buffer: parse_var("OUTBOUND_BUFFER", defaults.outbound_buffer)?,
            input_rate_limit: parse_var("INPUT_RATE_LIMIT", defaults.input_rate_limit)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.room_capacity == 0 {
            return Err(ConfigError::OutOfRange("ROOM_CAPACITY"));
        }
        if self.tick_rate == 0 || self.tick_rate > 240 {
            return Err(ConfigError::OutOfRange("TICK_RATE"));
        }
        if self.stats_interval.is_zero() {
            return Err(ConfigError::OutOfRange("STATS_INTERVAL_MS"));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::OutOfRange("HEARTBEAT_INTERVAL_SECS"));
        }
        if self.idle_timeout <= self.heartbeat_interval {
            return Err(ConfigError::OutOfRange("IDLE_TIMEOUT_SECS"));
        }
        if self.outbound_buffer == 0 {
            return Err(ConfigError::OutOfRange("OUTBOUND_BUFFER"));
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value: raw }),
        Err(_) => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid server address format")]
    InvalidAddress,

    #[error("Invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },

    #[error("{0} is out of range")]
    OutOfRange(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.room_capacity, 8);
        assert_eq!(config.tick_rate, 30);
        assert_eq!(config.stats_interval, Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let config = Config {
            room_capacity: 0,
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfRange("ROOM_CAPACITY"))
        ));
    }

    #[test]
    fn test_validate_rejects_idle_timeout_below_heartbeat() {
        let config = Config {
            idle_timeout: Duration::from_secs(5),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_var_falls_back_to_default() {
        let value: u32 = parse_var("ROOM_SESSION_TEST_UNSET_VARIABLE", 7).unwrap();
        assert_eq!(value, 7);
    }
}
