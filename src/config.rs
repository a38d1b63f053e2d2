use std::env;
use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";

/// Largest value accepted for any `*_SECONDS` setting (one week).
pub const MAX_SECONDS: u64 = 7 * 24 * 60 * 60;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{var} must be a valid {expected}, got {value:?}")]
    Invalid {
        var: &'static str,
        expected: &'static str,
        value: String,
    },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("{var} must be at most {max} seconds, got {value}")]
    TooLarge {
        var: &'static str,
        max: u64,
        value: u64,
    },
}

/// Runtime settings, read once at process start.
#[derive(Debug, Clone)]
pub struct Config {
    /// Upstream credential. `None` keeps the server up but fails every chat request.
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub response_language: String,
    pub bind_addr: String,
    pub port: u16,
    pub rate_limit_max_requests: u32,
    pub rate_limit_window: Duration,
    pub rate_limit_sweep_interval: Duration,
    /// Upper bound on waiting for upstream response headers.
    pub upstream_timeout: Duration,
    /// Upper bound on the gap between two streamed chunks.
    pub stream_idle_timeout: Duration,
    pub include_strategy_details: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            temperature: 0.4,
            response_language: "Turkish".to_string(),
            bind_addr: "127.0.0.1".to_string(),
            port: 3000,
            rate_limit_max_requests: 5,
            rate_limit_window: Duration::from_secs(60),
            rate_limit_sweep_interval: Duration::from_secs(300),
            upstream_timeout: Duration::from_secs(30),
            stream_idle_timeout: Duration::from_secs(60),
            include_strategy_details: false,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Self::default();

        let config = Self {
            api_key: get("OPENAI_API_KEY"),
            base_url: get("OPENAI_BASE_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.base_url),
            model: get("OPENAI_MODEL").unwrap_or(defaults.model),
            temperature: parse_or(
                "ADVISOR_TEMPERATURE",
                get("ADVISOR_TEMPERATURE"),
                "number",
                defaults.temperature,
            )?,
            response_language: get("ADVISOR_RESPONSE_LANGUAGE")
                .unwrap_or(defaults.response_language),
            bind_addr: get("ADVISOR_BIND_ADDR").unwrap_or(defaults.bind_addr),
            port: parse_or("ADVISOR_PORT", get("ADVISOR_PORT"), "port number", defaults.port)?,
            rate_limit_max_requests: non_zero(
                "RATE_LIMIT_MAX_REQUESTS",
                parse_or(
                    "RATE_LIMIT_MAX_REQUESTS",
                    get("RATE_LIMIT_MAX_REQUESTS"),
                    "integer",
                    defaults.rate_limit_max_requests,
                )?,
            )?,
            rate_limit_window: seconds(
                "RATE_LIMIT_WINDOW_SECONDS",
                get("RATE_LIMIT_WINDOW_SECONDS"),
                defaults.rate_limit_window,
            )?,
            rate_limit_sweep_interval: seconds(
                "RATE_LIMIT_SWEEP_SECONDS",
                get("RATE_LIMIT_SWEEP_SECONDS"),
                defaults.rate_limit_sweep_interval,
            )?,
            upstream_timeout: seconds(
                "UPSTREAM_TIMEOUT_SECONDS",
                get("UPSTREAM_TIMEOUT_SECONDS"),
                defaults.upstream_timeout,
            )?,
            stream_idle_timeout: seconds(
                "STREAM_IDLE_TIMEOUT_SECONDS",
                get("STREAM_IDLE_TIMEOUT_SECONDS"),
                defaults.stream_idle_timeout,
            )?,
            include_strategy_details: get("ADVISOR_INCLUDE_STRATEGY_DETAILS")
                .map(|s| s.to_lowercase() != "false" && s != "0")
                .unwrap_or(defaults.include_strategy_details),
        };

        if !(0.0..=2.0).contains(&config.temperature) {
            return Err(ConfigError::Invalid {
                var: "ADVISOR_TEMPERATURE",
                expected: "number between 0 and 2",
                value: config.temperature.to_string(),
            });
        }

        Ok(config)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}

fn parse_or<T: std::str::FromStr>(
    var: &'static str,
    raw: Option<String>,
    expected: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match raw {
        None => Ok(default),
        Some(value) => value.parse::<T>().map_err(|_| ConfigError::Invalid {
            var,
            expected,
            value,
        }),
    }
}

fn non_zero(var: &'static str, value: u32) -> Result<u32, ConfigError> {
    if value == 0 {
        return Err(ConfigError::Zero(var));
    }
    Ok(value)
}

fn seconds(
    var: &'static str,
    raw: Option<String>,
    default: Duration,
) -> Result<Duration, ConfigError> {
    let secs = parse_or(var, raw, "number of seconds", default.as_secs())?;
    if secs == 0 {
        return Err(ConfigError::Zero(var));
    }
    if secs > MAX_SECONDS {
        return Err(ConfigError::TooLarge {
            var,
            max: MAX_SECONDS,
            value: secs,
        });
    }
    Ok(Duration::from_secs(secs))
}
