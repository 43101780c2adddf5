//! Server configuration.

use std::time::Duration;

use thiserror::Error;

use crate::session::SessionConfig;

/// Quiescence delay before a dirty document is saved.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(3_000);
/// Upper bound on how long a continuously edited document stays unsaved.
pub const DEFAULT_MAX_DEBOUNCE: Duration = Duration::from_millis(10_000);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} is not a valid {expected}: {value:?}")]
    InvalidValue {
        var: &'static str,
        expected: &'static str,
        value: String,
    },
    #[error("max_debounce ({max:?}) is shorter than debounce ({debounce:?})")]
    DebounceOrder { debounce: Duration, max: Duration },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Debounce window, reset on every edit
    pub debounce: Duration,
    /// Max-debounce window, fixed at the first edit of a dirty streak
    pub max_debounce: Duration,
    /// Fan-out buffer per session (messages per lagging receiver)
    pub broadcast_capacity: usize,
    /// Session mailbox size
    pub command_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:1234".to_string(),
            debounce: DEFAULT_DEBOUNCE,
            max_debounce: DEFAULT_MAX_DEBOUNCE,
            broadcast_capacity: 256,
            command_capacity: 1024,
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `QUILL_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = lookup("QUILL_BIND_ADDR") {
            config.bind_addr = addr;
        } else if let Some(port) = lookup("QUILL_PORT") {
            let port: u16 = parse("QUILL_PORT", "port number", &port)?;
            config.bind_addr = format!("0.0.0.0:{port}");
        }
        if let Some(ms) = lookup("QUILL_DEBOUNCE_MS") {
            config.debounce = Duration::from_millis(parse("QUILL_DEBOUNCE_MS", "millisecond count", &ms)?);
        }
        if let Some(ms) = lookup("QUILL_MAX_DEBOUNCE_MS") {
            config.max_debounce =
                Duration::from_millis(parse("QUILL_MAX_DEBOUNCE_MS", "millisecond count", &ms)?);
        }
        if let Some(cap) = lookup("QUILL_BROADCAST_CAPACITY") {
            config.broadcast_capacity = parse("QUILL_BROADCAST_CAPACITY", "capacity", &cap)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Per-session tunables derived from this config.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            debounce: self.debounce,
            max_debounce: self.max_debounce,
            broadcast_capacity: self.broadcast_capacity,
            command_capacity: self.command_capacity,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.debounce.is_zero() {
            return Err(ConfigError::Zero("debounce"));
        }
        if self.max_debounce < self.debounce {
            return Err(ConfigError::DebounceOrder {
                debounce: self.debounce,
                max: self.max_debounce,
            });
        }
        if self.broadcast_capacity == 0 {
            return Err(ConfigError::Zero("broadcast_capacity"));
        }
        if self.command_capacity == 0 {
            return Err(ConfigError::Zero("command_capacity"));
        }
        Ok(())
    }
}

fn parse<T: std::str::FromStr>(var: &'static str, expected: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        var,
        expected,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:1234");
        assert_eq!(config.debounce, Duration::from_secs(3));
        assert_eq!(config.max_debounce, Duration::from_secs(10));
        assert_eq!(config.broadcast_capacity, 256);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("QUILL_PORT", "8080"),
            ("QUILL_DEBOUNCE_MS", "500"),
            ("QUILL_MAX_DEBOUNCE_MS", "2000"),
            ("QUILL_BROADCAST_CAPACITY", "32"),
        ]))
        .unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.debounce, Duration::from_millis(500));
        assert_eq!(config.max_debounce, Duration::from_millis(2000));
        assert_eq!(config.broadcast_capacity, 32);
    }

    #[test]
    fn test_bind_addr_wins_over_port() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("QUILL_BIND_ADDR", "10.0.0.1:9000"),
            ("QUILL_PORT", "8080"),
        ]))
        .unwrap();
        assert_eq!(config.bind_addr, "10.0.0.1:9000");
    }

    #[test]
    fn test_invalid_number_rejected() {
        let err = ServerConfig::from_lookup(lookup(&[("QUILL_DEBOUNCE_MS", "soon")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { var: "QUILL_DEBOUNCE_MS", .. }));
    }

    #[test]
    fn test_max_debounce_must_not_be_shorter() {
        let err = ServerConfig::from_lookup(lookup(&[
            ("QUILL_DEBOUNCE_MS", "5000"),
            ("QUILL_MAX_DEBOUNCE_MS", "1000"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::DebounceOrder { .. }));
    }
}
