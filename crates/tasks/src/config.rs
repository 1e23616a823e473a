//! Monitor configuration loaded from environment variables.

use std::time::Duration;

use mangaforge_realtime::{ChannelConfig, Heartbeat, ReconnectConfig};

use crate::reconciler::PollConfig;

/// Errors from reading the configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} environment variable is required")]
    Missing(&'static str),

    #[error("{var} must be {expected}, got '{value}'")]
    Invalid {
        var: &'static str,
        value: String,
        expected: &'static str,
    },
}

/// Everything [`crate::TaskMonitor`] needs to compose the subsystem.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Push channel endpoint, credential and reconnection policy.
    pub channel: ChannelConfig,
    /// REST base URL of the generation backend.
    pub api_base_url: String,
    /// Bearer credential for REST calls (shared with the push channel).
    pub api_token: Option<String>,
    /// Per-request timeout for REST calls other than status polls.
    pub api_request_timeout: Duration,
    pub poll: PollConfig,
}

impl MonitorConfig {
    /// Defaults for everything except the two endpoints.
    pub fn new(ws_url: impl Into<String>, api_base_url: impl Into<String>) -> Self {
        Self {
            channel: ChannelConfig::new(ws_url),
            api_base_url: api_base_url.into(),
            api_token: None,
            api_request_timeout: Duration::from_secs(30),
            poll: PollConfig::default(),
        }
    }

    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                    | Default  |
    /// |----------------------------|----------|
    /// | `PUSH_WS_URL`              | required |
    /// | `API_BASE_URL`             | required |
    /// | `API_TOKEN`                | none     |
    /// | `API_REQUEST_TIMEOUT_MS`   | `30000`  |
    /// | `POLL_INTERVAL_MS`         | `2000`   |
    /// | `POLL_REQUEST_TIMEOUT_MS`  | `5000`   |
    /// | `POLL_DEGRADED_AFTER`      | `3`      |
    /// | `RECONNECT_BASE_MS`        | `1000`   |
    /// | `RECONNECT_MAX_DELAY_MS`   | `30000`  |
    /// | `RECONNECT_MAX_ATTEMPTS`   | `5`      |
    /// | `HANDSHAKE_TIMEOUT_MS`     | `10000`  |
    /// | `PING_INTERVAL_MS`         | `30000`  |
    /// | `IDLE_TIMEOUT_MS`          | `75000`  |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`MonitorConfig::from_env`] with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Lookup(lookup);

        let ws_url = env.required("PUSH_WS_URL")?;
        let api_base_url = env.required("API_BASE_URL")?;
        let api_token = env.optional("API_TOKEN");

        let mut config = Self::new(ws_url, api_base_url);
        config.api_token = api_token.clone();
        config.api_request_timeout = env.millis("API_REQUEST_TIMEOUT_MS", 30_000)?;

        config.poll = PollConfig {
            interval: env.millis("POLL_INTERVAL_MS", 2_000)?,
            request_timeout: env.millis("POLL_REQUEST_TIMEOUT_MS", 5_000)?,
            degraded_after: env.number("POLL_DEGRADED_AFTER", 3)?,
        };

        config.channel.token = api_token;
        config.channel.handshake_timeout = env.millis("HANDSHAKE_TIMEOUT_MS", 10_000)?;
        config.channel.reconnect = ReconnectConfig {
            base_delay: env.millis("RECONNECT_BASE_MS", 1_000)?,
            max_delay: env.millis("RECONNECT_MAX_DELAY_MS", 30_000)?,
            max_attempts: env.number("RECONNECT_MAX_ATTEMPTS", 5)?,
        };
        config.channel.heartbeat = Heartbeat {
            ping_interval: env.millis("PING_INTERVAL_MS", 30_000)?,
            idle_timeout: env.millis("IDLE_TIMEOUT_MS", 75_000)?,
        };

        Ok(config)
    }
}

struct Lookup<F>(F);

impl<F: Fn(&str) -> Option<String>> Lookup<F> {
    fn optional(&self, var: &'static str) -> Option<String> {
        (self.0)(var)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, var: &'static str) -> Result<String, ConfigError> {
        self.optional(var).ok_or(ConfigError::Missing(var))
    }

    fn number<T: std::str::FromStr>(&self, var: &'static str, default: T) -> Result<T, ConfigError> {
        match self.optional(var) {
            None => Ok(default),
            Some(value) => value.parse().map_err(|_| ConfigError::Invalid {
                var,
                value,
                expected: "a non-negative integer",
            }),
        }
    }

    fn millis(&self, var: &'static str, default: u64) -> Result<Duration, ConfigError> {
        let ms: u64 = self.number(var, default)?;
        if ms == 0 {
            return Err(ConfigError::Invalid {
                var,
                value: ms.to_string(),
                expected: "a positive number of milliseconds",
            });
        }
        Ok(Duration::from_millis(ms))
    }
}
