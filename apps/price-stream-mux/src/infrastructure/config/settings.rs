//! Service Configuration Settings
//!
//! Configuration types for the price stream multiplexer, loaded from
//! environment variables.

use std::time::Duration;

use crate::infrastructure::feed::heartbeat::HeartbeatConfig;
use crate::infrastructure::feed::reconnect::ReconnectConfig;

/// Feed connection settings.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedSettings {
    /// Heartbeat ping interval.
    pub heartbeat_interval: Duration,
    /// Silence before the connection is considered dead.
    pub heartbeat_timeout: Duration,
    /// Initial reconnection delay.
    pub reconnect_delay_initial: Duration,
    /// Maximum reconnection delay.
    pub reconnect_delay_max: Duration,
    /// Reconnection delay multiplier for exponential backoff.
    pub reconnect_delay_multiplier: f64,
    /// Jitter fraction applied to each reconnection delay.
    pub reconnect_jitter: f64,
    /// Maximum consecutive reconnection attempts (0 = unlimited).
    pub max_reconnect_attempts: u32,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(20),
            heartbeat_timeout: Duration::from_secs(40),
            reconnect_delay_initial: Duration::from_millis(500),
            reconnect_delay_max: Duration::from_secs(30),
            reconnect_delay_multiplier: 2.0,
            reconnect_jitter: 0.1,
            max_reconnect_attempts: 0, // Unlimited
        }
    }
}

/// Multiplexer behavior settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiplexerSettings {
    /// Coalescing window for subscribe/unsubscribe changes (0 = manual flush).
    pub batch_window: Duration,
    /// Upper bound on the connection handshake.
    pub handshake_timeout: Duration,
    /// Connected time after which the backoff schedule resets.
    pub stable_after: Duration,
    /// Maximum number of distinct symbols with interest.
    pub max_symbols: usize,
    /// Subscribe every vendor spelling of a symbol instead of the canonical one.
    pub expand_vendor_forms: bool,
}

impl Default for MultiplexerSettings {
    fn default() -> Self {
        Self {
            batch_window: Duration::from_millis(50),
            handshake_timeout: Duration::from_secs(10),
            stable_after: Duration::from_secs(5),
            max_symbols: 500,
            expand_vendor_forms: false,
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    /// Health check HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { health_port: 8083 }
    }
}

/// Everything the multiplexer needs to run a session.
#[derive(Debug, Clone, PartialEq)]
pub struct MultiplexerConfig {
    /// Coalescing window for subscribe/unsubscribe changes (0 = manual flush).
    pub batch_window: Duration,
    /// Upper bound on the connection handshake.
    pub handshake_timeout: Duration,
    /// Connected time after which the backoff schedule resets.
    pub stable_after: Duration,
    /// Maximum number of distinct symbols with interest.
    pub max_symbols: usize,
    /// Subscribe every vendor spelling of a symbol instead of the canonical one.
    pub expand_vendor_forms: bool,
    /// Reconnection backoff.
    pub reconnect: ReconnectConfig,
    /// Heartbeat for transports that support it.
    pub heartbeat: HeartbeatConfig,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self::from_settings(&MultiplexerSettings::default(), &FeedSettings::default())
    }
}

impl MultiplexerConfig {
    /// Assemble from settings groups.
    #[must_use]
    pub fn from_settings(multiplexer: &MultiplexerSettings, feed: &FeedSettings) -> Self {
        Self {
            batch_window: multiplexer.batch_window,
            handshake_timeout: multiplexer.handshake_timeout,
            stable_after: multiplexer.stable_after,
            max_symbols: multiplexer.max_symbols,
            expand_vendor_forms: multiplexer.expand_vendor_forms,
            reconnect: ReconnectConfig::from_feed_settings(feed),
            heartbeat: HeartbeatConfig::from_feed_settings(feed),
        }
    }
}

/// Complete service configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    /// WebSocket URL of the upstream feed.
    pub url: String,
    /// Watchlist subscribed by the service binary at startup.
    pub symbols: Vec<String>,
    /// Server port settings.
    pub server: ServerSettings,
    /// Feed connection settings.
    pub feed: FeedSettings,
    /// Multiplexer behavior settings.
    pub multiplexer: MultiplexerSettings,
}

impl ServiceConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required environment variables are missing.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Returns an error if `PRICE_STREAM_URL` is missing or empty.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let url = lookup("PRICE_STREAM_URL")
            .ok_or_else(|| ConfigError::MissingEnvVar("PRICE_STREAM_URL".to_string()))?;

        if url.trim().is_empty() {
            return Err(ConfigError::EmptyValue("PRICE_STREAM_URL".to_string()));
        }

        let symbols = lookup("PRICE_STREAM_SYMBOLS")
            .map(|list| parse_symbol_list(&list))
            .unwrap_or_default();

        let server = ServerSettings {
            health_port: parse_env_u16(
                &lookup,
                "PRICE_STREAM_HEALTH_PORT",
                ServerSettings::default().health_port,
            ),
        };

        let defaults = FeedSettings::default();
        let feed = FeedSettings {
            heartbeat_interval: parse_env_duration_secs(
                &lookup,
                "PRICE_STREAM_HEARTBEAT_INTERVAL_SECS",
                defaults.heartbeat_interval,
            ),
            heartbeat_timeout: parse_env_duration_secs(
                &lookup,
                "PRICE_STREAM_HEARTBEAT_TIMEOUT_SECS",
                defaults.heartbeat_timeout,
            ),
            reconnect_delay_initial: parse_env_duration_millis(
                &lookup,
                "PRICE_STREAM_RECONNECT_DELAY_INITIAL_MS",
                defaults.reconnect_delay_initial,
            ),
            reconnect_delay_max: parse_env_duration_secs(
                &lookup,
                "PRICE_STREAM_RECONNECT_DELAY_MAX_SECS",
                defaults.reconnect_delay_max,
            ),
            reconnect_delay_multiplier: parse_env_f64(
                &lookup,
                "PRICE_STREAM_RECONNECT_DELAY_MULTIPLIER",
                defaults.reconnect_delay_multiplier,
            ),
            reconnect_jitter: parse_env_f64(
                &lookup,
                "PRICE_STREAM_RECONNECT_JITTER",
                defaults.reconnect_jitter,
            ),
            max_reconnect_attempts: parse_env_u32(
                &lookup,
                "PRICE_STREAM_MAX_RECONNECT_ATTEMPTS",
                defaults.max_reconnect_attempts,
            ),
        };

        let defaults = MultiplexerSettings::default();
        let multiplexer = MultiplexerSettings {
            batch_window: parse_env_duration_millis(
                &lookup,
                "PRICE_STREAM_BATCH_WINDOW_MS",
                defaults.batch_window,
            ),
            handshake_timeout: parse_env_duration_secs(
                &lookup,
                "PRICE_STREAM_HANDSHAKE_TIMEOUT_SECS",
                defaults.handshake_timeout,
            ),
            stable_after: parse_env_duration_secs(
                &lookup,
                "PRICE_STREAM_STABLE_AFTER_SECS",
                defaults.stable_after,
            ),
            max_symbols: parse_env_usize(
                &lookup,
                "PRICE_STREAM_MAX_SYMBOLS",
                defaults.max_symbols,
            ),
            expand_vendor_forms: parse_env_bool(
                &lookup,
                "PRICE_STREAM_EXPAND_VENDOR_FORMS",
                defaults.expand_vendor_forms,
            ),
        };

        Ok(Self {
            url: url.trim().to_string(),
            symbols,
            server,
            feed,
            multiplexer,
        })
    }

    /// Multiplexer configuration derived from these settings.
    #[must_use]
    pub fn multiplexer_config(&self) -> MultiplexerConfig {
        MultiplexerConfig::from_settings(&self.multiplexer, &self.feed)
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
}

fn parse_symbol_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn parse_env_u16<F: Fn(&str) -> Option<String>>(lookup: &F, key: &str, default: u16) -> u16 {
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_env_u32<F: Fn(&str) -> Option<String>>(lookup: &F, key: &str, default: u32) -> u32 {
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_env_usize<F: Fn(&str) -> Option<String>>(lookup: &F, key: &str, default: usize) -> usize {
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_env_f64<F: Fn(&str) -> Option<String>>(lookup: &F, key: &str, default: f64) -> f64 {
    lookup(key)
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(default)
}

fn parse_env_bool<F: Fn(&str) -> Option<String>>(lookup: &F, key: &str, default: bool) -> bool {
    lookup(key).map_or(default, |v| {
        match v.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        }
    })
}

fn parse_env_duration_secs<F: Fn(&str) -> Option<String>>(
    lookup: &F,
    key: &str,
    default: Duration,
) -> Duration {
    lookup(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}

fn parse_env_duration_millis<F: Fn(&str) -> Option<String>>(
    lookup: &F,
    key: &str,
    default: Duration,
) -> Duration {
    lookup(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_millis)
}
