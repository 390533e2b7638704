//! Heartbeat Monitor
//!
//! Tracks feed liveness through periodic pings. Any inbound traffic (data,
//! ping or pong) counts as a sign of life; if nothing arrives within
//! `pong_timeout` the connection is considered dead and is failed so the
//! connection manager can reconnect.
//!
//! The monitor is a plain state machine driven by the WebSocket read loop,
//! which owns the timer, so it can be tested with synthetic instants.

use std::time::{Duration, Instant};

use crate::infrastructure::config::FeedSettings;

/// Configuration for heartbeat behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Interval between ping messages (zero disables the heartbeat).
    pub ping_interval: Duration,
    /// Silence after which the connection is considered dead.
    pub pong_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(20),
            pong_timeout: Duration::from_secs(40),
        }
    }
}

impl HeartbeatConfig {
    /// Create a new configuration with custom values.
    #[must_use]
    pub const fn new(ping_interval: Duration, pong_timeout: Duration) -> Self {
        Self {
            ping_interval,
            pong_timeout,
        }
    }

    /// Create configuration from `FeedSettings`.
    #[must_use]
    pub const fn from_feed_settings(settings: &FeedSettings) -> Self {
        Self {
            ping_interval: settings.heartbeat_interval,
            pong_timeout: settings.heartbeat_timeout,
        }
    }

    /// Heartbeat with no pings at all.
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            ping_interval: Duration::ZERO,
            pong_timeout: Duration::ZERO,
        }
    }

    /// Whether pings are sent.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        !self.ping_interval.is_zero()
    }
}

/// What the read loop should do on a heartbeat tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Send a ping.
    SendPing,
    /// The peer has been silent too long; fail the connection.
    Timeout,
}

/// Liveness tracker for one connection.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    last_seen: Instant,
    pings_outstanding: u32,
}

impl HeartbeatMonitor {
    /// Create a monitor for a connection that just opened.
    #[must_use]
    pub fn new(config: HeartbeatConfig) -> Self {
        Self::started_at(config, Instant::now())
    }

    /// Create a monitor whose last sign of life is `now`.
    #[must_use]
    pub const fn started_at(config: HeartbeatConfig, now: Instant) -> Self {
        Self {
            config,
            last_seen: now,
            pings_outstanding: 0,
        }
    }

    /// Record inbound traffic.
    pub fn record_activity(&mut self, now: Instant) {
        self.last_seen = now;
        self.pings_outstanding = 0;
    }

    /// Decide what to do on a timer tick.
    pub fn on_tick(&mut self, now: Instant) -> HeartbeatAction {
        let silent_for = now.saturating_duration_since(self.last_seen);

        if self.pings_outstanding > 0 && silent_for >= self.config.pong_timeout {
            tracing::warn!(
                silent_ms = u64::try_from(silent_for.as_millis()).unwrap_or(u64::MAX),
                timeout_ms = u64::try_from(self.config.pong_timeout.as_millis()).unwrap_or(u64::MAX),
                pings = self.pings_outstanding,
                "Heartbeat timeout detected"
            );
            return HeartbeatAction::Timeout;
        }

        self.pings_outstanding += 1;
        HeartbeatAction::SendPing
    }

    /// Pings sent since the last inbound traffic.
    #[must_use]
    pub const fn pings_outstanding(&self) -> u32 {
        self.pings_outstanding
    }

    /// Ping timer for the read loop, or `None` when disabled.
    #[must_use]
    pub fn interval(&self) -> Option<tokio::time::Interval> {
        if !self.config.is_enabled() {
            return None;
        }

        let period = self.config.ping_interval;
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        Some(interval)
    }
}

// =============================================================================
// Tests
// =============================================================================
