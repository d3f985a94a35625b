//! Tunables for connection lifecycle, timeouts, and cache sizing.
//!
//! Unlike `trailsd-trails/server`'s `Config::from_env`, this crate is a
//! library embedded in a host application rather than a standalone service,
//! so values are constructed programmatically instead of read from the
//! process environment — the host decides how (if at all) operators
//! configure it.

use std::time::Duration;

/// Configuration for a single [`crate::Connection`] or the [`crate::Manager`]
/// that owns many of them. All fields have defaults matching the protocol's
/// documented tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Hard cap on reconnection attempts before a Connection goes `FAILED`.
    pub max_reconnect_attempts: u32,
    /// Initial reconnect backoff, doubled on each attempt.
    pub initial_reconnect_delay_ms: u64,
    /// Ceiling on reconnect backoff regardless of attempt count.
    pub max_reconnect_delay_ms: u64,
    /// Deadline for opening the underlying stream.
    pub connect_timeout_ms: u64,
    /// Deadline for a `POST_*`/`GET_*`/`TAKE_*` command's `RTN_*` response.
    pub command_timeout_ms: u64,
    /// Deadline for a reading request's completing `NOT_DYN_*` notification.
    pub reading_timeout_ms: u64,
    /// Interval between liveness checks.
    pub ping_interval_ms: u64,
    /// How stale the last observed activity must be before a ping is sent.
    pub ping_inactivity_threshold_ms: u64,
    /// How long a `CONNECTED` transition is held before becoming externally
    /// visible, to absorb flapping links.
    pub state_debounce_ms: u64,
    /// Pacing delay between frames drained from the outbound queue.
    pub queue_drain_pacing_ms: u64,
    /// Max readings retained per kind per sensor per gateway.
    pub cache_per_kind_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 5,
            initial_reconnect_delay_ms: 1_000,
            max_reconnect_delay_ms: 30_000,
            connect_timeout_ms: 10_000,
            command_timeout_ms: 10_000,
            reading_timeout_ms: 30_000,
            ping_interval_ms: 30_000,
            ping_inactivity_threshold_ms: 20_000,
            state_debounce_ms: 2_000,
            queue_drain_pacing_ms: 100,
            cache_per_kind_capacity: 100,
        }
    }
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn reading_timeout(&self) -> Duration {
        Duration::from_millis(self.reading_timeout_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn ping_inactivity_threshold(&self) -> Duration {
        Duration::from_millis(self.ping_inactivity_threshold_ms)
    }

    pub fn state_debounce(&self) -> Duration {
        Duration::from_millis(self.state_debounce_ms)
    }

    pub fn queue_drain_pacing(&self) -> Duration {
        Duration::from_millis(self.queue_drain_pacing_ms)
    }

    /// Backoff delay before reconnect attempt `attempt` (1-indexed), per
    /// `spec.md` §4.2: `min(max_delay, initial * 2^(attempt-1))`.
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let scaled = self.initial_reconnect_delay_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(scaled.min(self.max_reconnect_delay_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let c = ClientConfig::default();
        assert_eq!(c.max_reconnect_attempts, 5);
        assert_eq!(c.initial_reconnect_delay_ms, 1_000);
        assert_eq!(c.max_reconnect_delay_ms, 30_000);
        assert_eq!(c.cache_per_kind_capacity, 100);
    }

    #[test]
    fn reconnect_delay_doubles_and_caps() {
        let c = ClientConfig::default();
        assert_eq!(c.reconnect_delay(1), Duration::from_millis(1_000));
        assert_eq!(c.reconnect_delay(2), Duration::from_millis(2_000));
        assert_eq!(c.reconnect_delay(3), Duration::from_millis(4_000));
        assert_eq!(c.reconnect_delay(4), Duration::from_millis(8_000));
        assert_eq!(c.reconnect_delay(5), Duration::from_millis(16_000));
        // 6th attempt would be 32s, capped to 30s.
        assert_eq!(c.reconnect_delay(6), Duration::from_millis(30_000));
    }
}
