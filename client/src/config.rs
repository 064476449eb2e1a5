//! Configuration management for the sync client.

use cardsync_engine::{Backoff, ConnectionPolicy, QueuePolicy, TransportMode};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Prefix of every recognised environment variable.
pub const ENV_PREFIX: &str = "CARDSYNC_";

/// Sync client configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Base HTTP(S) URL of the sync server
    pub endpoint: String,
    /// Polling or push delivery
    pub mode: TransportMode,
    /// Delay between polls
    pub poll_interval: Duration,
    /// Reconnect the push socket after it closes
    pub reconnect: bool,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    /// Push heartbeat period
    pub heartbeat_interval: Duration,
    /// Attempts before a queued mutation fails for good (`None` = unbounded)
    pub max_queue_attempts: Option<u32>,
    /// Bound on each mutation send
    pub send_timeout: Duration,
    /// Consecutive poll failures before the connection is degraded
    pub degraded_after_failures: u32,
    /// Queue file; in-memory queue when unset
    pub queue_path: Option<PathBuf>,
    /// User the client acts for
    pub user_id: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:3000".to_string(),
            mode: TransportMode::Polling,
            poll_interval: Duration::from_secs(5),
            reconnect: true,
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(30),
            max_queue_attempts: None,
            send_timeout: Duration::from_secs(10),
            degraded_after_failures: 3,
            queue_path: None,
            user_id: "anonymous".to_string(),
        }
    }
}

impl SyncConfig {
    /// Load configuration from `CARDSYNC_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through a variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));
        let defaults = Self::default();

        let endpoint = var("ENDPOINT")
            .unwrap_or(defaults.endpoint)
            .trim_end_matches('/')
            .to_string();

        let mode = match var("MODE").as_deref() {
            None => defaults.mode,
            Some("polling") => TransportMode::Polling,
            Some("push") => TransportMode::Push,
            Some(other) => return Err(ConfigError::InvalidMode(other.to_string())),
        };

        let millis = |name: &'static str, default: Duration| -> Result<Duration, ConfigError> {
            match var(name) {
                None => Ok(default),
                Some(raw) => raw
                    .parse::<u64>()
                    .map(Duration::from_millis)
                    .map_err(|_| ConfigError::InvalidNumber(name)),
            }
        };

        let reconnect = match var("RECONNECT").as_deref() {
            None => defaults.reconnect,
            Some("true" | "1" | "yes") => true,
            Some("false" | "0" | "no") => false,
            Some(_) => return Err(ConfigError::InvalidBool("RECONNECT")),
        };

        let max_queue_attempts = match var("MAX_QUEUE_ATTEMPTS") {
            None => defaults.max_queue_attempts,
            Some(raw) => Some(
                raw.parse::<u32>()
                    .map_err(|_| ConfigError::InvalidNumber("MAX_QUEUE_ATTEMPTS"))?,
            ),
        };

        let degraded_after_failures = match var("DEGRADED_AFTER_FAILURES") {
            None => defaults.degraded_after_failures,
            Some(raw) => raw
                .parse()
                .map_err(|_| ConfigError::InvalidNumber("DEGRADED_AFTER_FAILURES"))?,
        };

        let config = Self {
            endpoint,
            mode,
            poll_interval: millis("POLL_INTERVAL_MS", defaults.poll_interval)?,
            reconnect,
            reconnect_base_delay: millis("RECONNECT_BASE_DELAY_MS", defaults.reconnect_base_delay)?,
            reconnect_max_delay: millis("RECONNECT_MAX_DELAY_MS", defaults.reconnect_max_delay)?,
            heartbeat_interval: millis("HEARTBEAT_INTERVAL_MS", defaults.heartbeat_interval)?,
            max_queue_attempts,
            send_timeout: millis("SEND_TIMEOUT_MS", defaults.send_timeout)?,
            degraded_after_failures,
            queue_path: var("QUEUE_PATH").map(PathBuf::from),
            user_id: var("USER_ID").unwrap_or(defaults.user_id),
        };

        config.validate()?;
        Ok(config)
    }

    /// Check the configuration is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.endpoint.starts_with("http://") || self.endpoint.starts_with("https://")) {
            return Err(ConfigError::InvalidEndpoint(self.endpoint.clone()));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::ZeroDuration("POLL_INTERVAL_MS"));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::ZeroDuration("HEARTBEAT_INTERVAL_MS"));
        }
        if self.send_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("SEND_TIMEOUT_MS"));
        }
        if self.reconnect_base_delay > self.reconnect_max_delay {
            return Err(ConfigError::InvertedBackoff);
        }
        if self.max_queue_attempts == Some(0) {
            return Err(ConfigError::InvalidNumber("MAX_QUEUE_ATTEMPTS"));
        }
        if self.degraded_after_failures == 0 {
            return Err(ConfigError::InvalidNumber("DEGRADED_AFTER_FAILURES"));
        }
        Ok(())
    }

    /// Backoff shared by reconnects and queue retries.
    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            self.reconnect_base_delay.as_millis() as u64,
            self.reconnect_max_delay.as_millis() as u64,
        )
    }

    pub fn connection_policy(&self) -> ConnectionPolicy {
        ConnectionPolicy {
            mode: self.mode,
            reconnect: self.reconnect,
            degraded_after_failures: self.degraded_after_failures,
            backoff: self.backoff(),
        }
    }

    pub fn queue_policy(&self) -> QueuePolicy {
        QueuePolicy {
            max_attempts: self.max_queue_attempts,
            backoff: self.backoff(),
        }
    }

    /// `GET` endpoint for polling.
    pub fn updates_url(&self) -> String {
        format!("{}/updates", self.endpoint)
    }

    /// `POST` endpoint for mutations.
    pub fn mutations_url(&self) -> String {
        format!("{}/mutations", self.endpoint)
    }

    /// Push socket URL (`ws://` or `wss://`).
    pub fn ws_url(&self) -> String {
        let base = if let Some(rest) = self.endpoint.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = self.endpoint.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            self.endpoint.clone()
        };
        format!("{}/ws", base)
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid endpoint {0}: expected an http:// or https:// URL")]
    InvalidEndpoint(String),

    #[error("Invalid MODE value {0}: expected polling or push")]
    InvalidMode(String),

    #[error("Invalid {0} value")]
    InvalidNumber(&'static str),

    #[error("Invalid {0} value: expected true or false")]
    InvalidBool(&'static str),

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    #[error("RECONNECT_BASE_DELAY_MS exceeds RECONNECT_MAX_DELAY_MS")]
    InvertedBackoff,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<SyncConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (format!("{}{}", ENV_PREFIX, k), v.to_string()))
            .collect();
        SyncConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let config = load(&[]).unwrap();
        assert_eq!(config, SyncConfig::default());
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.send_timeout, Duration::from_secs(10));
        assert_eq!(config.max_queue_attempts, None);
    }

    #[test]
    fn reads_every_option() {
        let config = load(&[
            ("ENDPOINT", "https://sync.example.com/"),
            ("MODE", "push"),
            ("POLL_INTERVAL_MS", "2500"),
            ("RECONNECT", "false"),
            ("RECONNECT_BASE_DELAY_MS", "500"),
            ("RECONNECT_MAX_DELAY_MS", "8000"),
            ("HEARTBEAT_INTERVAL_MS", "1000"),
            ("MAX_QUEUE_ATTEMPTS", "5"),
            ("SEND_TIMEOUT_MS", "3000"),
            ("DEGRADED_AFTER_FAILURES", "2"),
            ("QUEUE_PATH", "/tmp/queue.json"),
            ("USER_ID", "alice"),
        ])
        .unwrap();

        assert_eq!(config.endpoint, "https://sync.example.com");
        assert_eq!(config.mode, TransportMode::Push);
        assert_eq!(config.poll_interval, Duration::from_millis(2500));
        assert!(!config.reconnect);
        assert_eq!(config.max_queue_attempts, Some(5));
        assert_eq!(config.degraded_after_failures, 2);
        assert_eq!(config.queue_path, Some(PathBuf::from("/tmp/queue.json")));
        assert_eq!(config.user_id, "alice");
        assert_eq!(config.ws_url(), "wss://sync.example.com/ws");
        assert_eq!(config.backoff(), Backoff::new(500, 8000));
    }

    #[test]
    fn rejects_bad_values() {
        assert_eq!(
            load(&[("MODE", "carrier-pigeon")]).unwrap_err(),
            ConfigError::InvalidMode("carrier-pigeon".into())
        );
        assert_eq!(
            load(&[("POLL_INTERVAL_MS", "soon")]).unwrap_err(),
            ConfigError::InvalidNumber("POLL_INTERVAL_MS")
        );
        assert_eq!(
            load(&[("POLL_INTERVAL_MS", "0")]).unwrap_err(),
            ConfigError::ZeroDuration("POLL_INTERVAL_MS")
        );
        assert_eq!(
            load(&[("ENDPOINT", "ftp://nope")]).unwrap_err(),
            ConfigError::InvalidEndpoint("ftp://nope".into())
        );
        assert_eq!(
            load(&[("RECONNECT_BASE_DELAY_MS", "60000")]).unwrap_err(),
            ConfigError::InvertedBackoff
        );
        assert_eq!(
            load(&[("MAX_QUEUE_ATTEMPTS", "0")]).unwrap_err(),
            ConfigError::InvalidNumber("MAX_QUEUE_ATTEMPTS")
        );
    }

    #[test]
    fn urls() {
        let config = SyncConfig::default();
        assert_eq!(config.updates_url(), "http://127.0.0.1:3000/updates");
        assert_eq!(config.mutations_url(), "http://127.0.0.1:3000/mutations");
        assert_eq!(config.ws_url(), "ws://127.0.0.1:3000/ws");
    }
}
